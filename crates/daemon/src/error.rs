use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for the broker core.
///
/// Allocator-level errors surface synchronously to the requesting caller;
/// reconciler-level errors are logged and retried at the next sweep.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The runtime failed to create a container.
    #[error("container provisioning failed: {0}")]
    Provision(String),

    /// The runtime could not report a published port for a known container.
    #[error("failed to resolve published port for {container_id}: {reason}")]
    PortResolution { container_id: String, reason: String },

    /// The inspected container no longer exists.
    #[error("container {0} not found")]
    NotFound(String),

    /// Lease store read/write failure.
    #[error("lease store failure: {0}")]
    Persist(#[from] rusqlite::Error),

    /// An external call exceeded its bound.
    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    /// The container runtime cannot be reached at all.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}
