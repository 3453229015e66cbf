//! Periodic sweep that evicts leases whose container has disappeared.
//!
//! The runtime is authoritative for liveness: a lease is deleted only when
//! its container is absent from the live listing, never because its
//! lifespan arithmetic says it should be over.

use crate::db::LeaseStore;
use crate::error::BrokerError;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

pub struct Reconciler {
    store: LeaseStore,
    runtime: Arc<dyn ContainerRuntime>,
    sweep_budget: Duration,
}

impl Reconciler {
    pub fn new(store: LeaseStore, runtime: Arc<dyn ContainerRuntime>, sweep_budget: Duration) -> Self {
        Self {
            store,
            runtime,
            sweep_budget,
        }
    }

    /// Sweep forever at a fixed interval. Sweeps never overlap: the next
    /// tick is not taken until the previous sweep has returned or been
    /// abandoned at its budget.
    pub async fn run(self, period: Duration) {
        let mut ticker = interval(period);
        loop {
            // The first tick fires immediately, which doubles as the
            // post-restart cleanup pass.
            ticker.tick().await;
            match timeout(self.sweep_budget, self.sweep()).await {
                Ok(Ok(evicted)) => {
                    if evicted > 0 {
                        info!(evicted, "sweep evicted stale leases");
                    } else {
                        debug!("sweep found nothing to evict");
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "sweep aborted, will retry next interval"),
                Err(_) => warn!(budget = ?self.sweep_budget, "sweep exceeded budget, abandoned"),
            }
        }
    }

    /// One reconciliation pass. Returns the number of leases evicted.
    pub async fn sweep(&self) -> Result<usize, BrokerError> {
        // A failed listing aborts the whole pass; an empty listing does
        // not. With no evidence any container is alive, every lease goes.
        let running = self.runtime.list_running_ids().await?;
        let leases = self.store.scan_all()?;

        let mut evicted = 0;
        for lease in leases {
            if running.contains(&lease.container_id) {
                debug!(identity = %lease.identity, container_id = %lease.container_id,
                    "container still running");
                continue;
            }
            match self.store.delete(&lease.identity) {
                Ok(()) => {
                    info!(identity = %lease.identity, container_id = %lease.container_id,
                        "evicted lease for dead container");
                    evicted += 1;
                }
                // Leave it for the next sweep; the allocator tolerates a
                // stale lease in the meantime.
                Err(e) => warn!(identity = %lease.identity, error = %e, "failed to evict lease"),
            }
        }
        Ok(evicted)
    }
}
