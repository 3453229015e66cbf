use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted binding between one client identity and one container.
///
/// Created exactly once per identity on a store miss, read on every
/// subsequent hit, and deleted only when the container is gone. Never
/// updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub identity: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl Lease {
    pub fn new(
        identity: impl Into<String>,
        container_id: impl Into<String>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            identity: identity.into(),
            container_id: container_id.into(),
            created_at: Utc::now(),
            ttl_seconds,
        }
    }

    /// Seconds of runtime-enforced lifespan left, clamped at zero.
    ///
    /// Informational only: the container's own `sleep` bound is
    /// authoritative, not this arithmetic.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        let deadline = self.created_at + chrono::Duration::seconds(self.ttl_seconds as i64);
        (deadline - now).num_seconds().max(0) as u64
    }
}

/// Transient allocation result handed back to a caller. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxHandle {
    pub container_id: String,
    pub host_port: u16,
    pub newly_created: bool,
    pub remaining_seconds: u64,
}

/// Wire shape for the daemon's `/list` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub identity: String,
    pub container_id: String,
    pub allocated_at: DateTime<Utc>,
    pub age_seconds: u64,
    pub remaining_seconds: u64,
}
