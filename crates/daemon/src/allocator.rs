//! Get-or-create allocation with single-flight semantics per identity.

use crate::db::LeaseStore;
use crate::error::BrokerError;
use crate::runtime::ContainerRuntime;
use chrono::Utc;
use common::{BoxHandle, Lease};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Process-wide parameters applied to every container creation.
#[derive(Debug, Clone)]
pub struct BoxConfig {
    pub image: String,
    pub command: String,
    pub exposed_port: u16,
    pub lifespan_seconds: u64,
}

pub struct Allocator {
    store: LeaseStore,
    runtime: Arc<dyn ContainerRuntime>,
    config: BoxConfig,
    runtime_timeout: Duration,
    // One async mutex per in-flight identity; entries nobody holds are
    // pruned on the next lookup.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Allocator {
    pub fn new(
        store: LeaseStore,
        runtime: Arc<dyn ContainerRuntime>,
        config: BoxConfig,
        runtime_timeout: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            config,
            runtime_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    fn lock_for(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        // A strong count of one means the map holds the only reference, so
        // no request for that identity is in flight and the entry can go.
        // Single-flight is unaffected: concurrent callers for one identity
        // keep its count above one until the last of them finishes.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        timeout(self.runtime_timeout, fut)
            .await
            .map_err(|_| BrokerError::Timeout(self.runtime_timeout))?
    }

    /// Return the box already leased to `identity`, or create one.
    ///
    /// The per-identity mutex is held across the whole read/create/persist
    /// sequence. That serializes racing duplicate requests behind the
    /// runtime's multi-second create latency, but it is what makes
    /// at-most-one-creation trivially true; requests for other identities
    /// are untouched since they lock different mutexes.
    pub async fn get_or_create(&self, identity: &str) -> Result<BoxHandle, BrokerError> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock().await;

        if let Some(lease) = self.store.get(identity)? {
            match self
                .bounded(
                    self.runtime
                        .resolve_published_port(&lease.container_id, self.config.exposed_port),
                )
                .await
            {
                Ok(host_port) => {
                    info!(identity, container_id = %lease.container_id, "existing challenge box");
                    return Ok(BoxHandle {
                        remaining_seconds: lease.remaining_seconds(Utc::now()),
                        container_id: lease.container_id,
                        host_port,
                        newly_created: false,
                    });
                }
                // The container died before the reconciler noticed; treat
                // the lease as a miss and fall through to a fresh create.
                Err(BrokerError::NotFound(_)) => {
                    warn!(identity, container_id = %lease.container_id,
                        "leased container is gone, creating a replacement");
                }
                Err(e) => return Err(e),
            }
        }

        info!(identity, "no live challenge box, creating one");
        let container_id = self
            .bounded(self.runtime.create_detached(
                &self.config.image,
                &self.config.command,
                self.config.lifespan_seconds,
                self.config.exposed_port,
            ))
            .await?;

        // Persist before releasing the identity lock so a queued duplicate
        // request observes the write. INSERT OR REPLACE also covers the
        // stale-lease overwrite path above.
        let lease = Lease::new(identity, container_id.clone(), self.config.lifespan_seconds);
        self.store.put(&lease)?;

        // The container exists and is tracked from here on, so a port
        // resolution failure surfaces as its own error rather than rolling
        // anything back.
        let host_port = self
            .bounded(
                self.runtime
                    .resolve_published_port(&container_id, self.config.exposed_port),
            )
            .await?;

        info!(identity, container_id = %container_id, host_port, "challenge box created");
        Ok(BoxHandle {
            container_id,
            host_port,
            newly_created: true,
            remaining_seconds: self.config.lifespan_seconds,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory runtime double: containers are entries in a map from ID
    /// to published host port.
    pub(crate) struct FakeRuntime {
        pub running: Mutex<HashMap<String, u16>>,
        pub create_calls: AtomicUsize,
        pub fail_create: AtomicBool,
        pub fail_resolve: AtomicBool,
        pub fail_list: AtomicBool,
        pub create_delay: Option<Duration>,
        pub list_delay: Mutex<Option<Duration>>,
        next_id: AtomicUsize,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self {
                running: Mutex::new(HashMap::new()),
                create_calls: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                fail_resolve: AtomicBool::new(false),
                fail_list: AtomicBool::new(false),
                create_delay: None,
                list_delay: Mutex::new(None),
                next_id: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                create_delay: Some(delay),
                ..Self::new()
            }
        }

        /// Register a container as already running, as if it predated the
        /// broker process.
        pub fn insert_running(&self, id: &str, host_port: u16) {
            self.running.lock().unwrap().insert(id.to_string(), host_port);
        }

        pub fn kill(&self, id: &str) {
            self.running.lock().unwrap().remove(id);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_detached(
            &self,
            _image: &str,
            _command: &str,
            _lifespan_seconds: u64,
            _exposed_port: u16,
        ) -> Result<String, BrokerError> {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(BrokerError::Provision("image pull failed".into()));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("box-{n}");
            self.running
                .lock()
                .unwrap()
                .insert(id.clone(), 32768 + n as u16);
            Ok(id)
        }

        async fn resolve_published_port(
            &self,
            container_id: &str,
            _exposed_port: u16,
        ) -> Result<u16, BrokerError> {
            if self.fail_resolve.load(Ordering::SeqCst) {
                return Err(BrokerError::PortResolution {
                    container_id: container_id.to_string(),
                    reason: "inspect failed".into(),
                });
            }
            self.running
                .lock()
                .unwrap()
                .get(container_id)
                .copied()
                .ok_or_else(|| BrokerError::NotFound(container_id.to_string()))
        }

        async fn list_running_ids(&self) -> Result<HashSet<String>, BrokerError> {
            let delay = *self.list_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(BrokerError::RuntimeUnavailable("daemon not responding".into()));
            }
            Ok(self.running.lock().unwrap().keys().cloned().collect())
        }
    }

    pub(crate) fn test_config() -> BoxConfig {
        BoxConfig {
            image: "ubuntu".into(),
            command: "/usr/sbin/sshd".into(),
            exposed_port: 22,
            lifespan_seconds: 60,
        }
    }

    fn allocator(runtime: Arc<FakeRuntime>) -> Allocator {
        Allocator::new(
            LeaseStore::in_memory().unwrap(),
            runtime,
            test_config(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn fresh_identity_gets_new_box() {
        let runtime = Arc::new(FakeRuntime::new());
        let alloc = allocator(runtime.clone());

        let handle = alloc.get_or_create("10.0.0.1").await.unwrap();
        assert!(handle.newly_created);
        assert_eq!(handle.remaining_seconds, 60);
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 1);

        let lease = alloc.store().get("10.0.0.1").unwrap().unwrap();
        assert_eq!(lease.container_id, handle.container_id);
    }

    #[tokio::test]
    async fn live_lease_is_reused_without_creating() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_running("c123", 40022);
        let alloc = allocator(runtime.clone());
        alloc.store().put(&Lease::new("10.0.0.1", "c123", 60)).unwrap();

        let handle = alloc.get_or_create("10.0.0.1").await.unwrap();
        assert!(!handle.newly_created);
        assert_eq!(handle.container_id, "c123");
        assert_eq!(handle.host_port, 40022);
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_identity_create_once() {
        let runtime = Arc::new(FakeRuntime::with_delay(Duration::from_millis(20)));
        let alloc = Arc::new(allocator(runtime.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(
                async move { alloc.get_or_create("10.0.0.1").await },
            ));
        }

        let mut container_ids = HashSet::new();
        for h in handles {
            let handle = h.await.unwrap().unwrap();
            container_ids.insert(handle.container_id);
        }

        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(container_ids.len(), 1);
    }

    #[tokio::test]
    async fn distinct_identities_allocate_independently() {
        let runtime = Arc::new(FakeRuntime::with_delay(Duration::from_millis(20)));
        let alloc = Arc::new(allocator(runtime.clone()));

        let a = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.get_or_create("10.0.0.1").await })
        };
        let b = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.get_or_create("10.0.0.2").await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_ne!(a.container_id, b.container_id);
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn quiescent_identity_locks_are_pruned() {
        let runtime = Arc::new(FakeRuntime::new());
        let alloc = allocator(runtime);

        for identity in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            alloc.get_or_create(identity).await.unwrap();
        }

        // Nothing is in flight any more, so the next lookup sheds every
        // earlier entry and tracks only itself.
        let _lock = alloc.lock_for("10.0.0.4");
        assert_eq!(alloc.tracked_locks(), 1);
    }

    #[tokio::test]
    async fn dead_container_lease_self_heals() {
        let runtime = Arc::new(FakeRuntime::new());
        let alloc = allocator(runtime.clone());
        alloc.store().put(&Lease::new("10.0.0.1", "cdead", 60)).unwrap();

        let handle = alloc.get_or_create("10.0.0.1").await.unwrap();
        assert!(handle.newly_created);
        assert_ne!(handle.container_id, "cdead");

        let lease = alloc.store().get("10.0.0.1").unwrap().unwrap();
        assert_eq!(lease.container_id, handle.container_id);
    }

    #[tokio::test]
    async fn create_failure_writes_no_lease() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_create.store(true, Ordering::SeqCst);
        let alloc = allocator(runtime.clone());

        let err = alloc.get_or_create("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, BrokerError::Provision(_)));
        assert!(alloc.store().get("10.0.0.1").unwrap().is_none());
    }

    #[tokio::test]
    async fn port_resolution_failure_keeps_the_lease() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_resolve.store(true, Ordering::SeqCst);
        let alloc = allocator(runtime.clone());

        let err = alloc.get_or_create("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, BrokerError::PortResolution { .. }));
        // The container was created and is tracked; only the port lookup
        // failed.
        assert!(alloc.store().get("10.0.0.1").unwrap().is_some());
        assert_eq!(runtime.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_create_times_out_without_a_lease() {
        let runtime = Arc::new(FakeRuntime::with_delay(Duration::from_secs(60)));
        let alloc = Allocator::new(
            LeaseStore::in_memory().unwrap(),
            runtime.clone(),
            test_config(),
            Duration::from_millis(30),
        );

        let err = alloc.get_or_create("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
        assert!(alloc.store().get("10.0.0.1").unwrap().is_none());
    }
}
