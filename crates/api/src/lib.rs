//! Fabrica API facade.
//!
//! The single boundary frontends talk through. `EngineApi` wires the trait
//! to live engine handles inside the daemon; `MockApi` serves frontend
//! tests without an engine.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use fabrica_core::{ResourceKey, SyncResult, SyncStatus};
use fabrica_sched::Scheduler;
use serde::{Deserialize, Serialize};

/// Engine-wide counters for the status surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineStats {
    pub queue_pending: usize,
    pub queue_dropped: u64,
    pub degraded: usize,
    pub owned_scopes: usize,
}

#[async_trait::async_trait]
pub trait FabricaApi: Send + Sync {
    /// Sync status for one key. Unknown keys are Idle.
    async fn status(&self, key: &ResourceKey) -> SyncResult<SyncStatus>;

    /// Every key with a non-default status, sorted.
    async fn statuses(&self) -> SyncResult<Vec<(ResourceKey, SyncStatus)>>;

    /// Clear parked failures under `scope` and force a full re-poll plus a
    /// reconcile cycle. Returns the number of observed deltas found.
    async fn resync(&self, scope: &ResourceKey) -> SyncResult<usize>;

    async fn stats(&self) -> SyncResult<EngineStats>;
}

/// Facade over a live scheduler.
pub struct EngineApi {
    sched: Arc<Scheduler>,
}

impl EngineApi {
    pub fn new(sched: Arc<Scheduler>) -> Arc<EngineApi> {
        Arc::new(EngineApi { sched })
    }
}

#[async_trait::async_trait]
impl FabricaApi for EngineApi {
    async fn status(&self, key: &ResourceKey) -> SyncResult<SyncStatus> {
        Ok(self.sched.registry().get(key))
    }

    async fn statuses(&self) -> SyncResult<Vec<(ResourceKey, SyncStatus)>> {
        Ok(self.sched.registry().all())
    }

    async fn resync(&self, scope: &ResourceKey) -> SyncResult<usize> {
        self.sched.resync(scope).await
    }

    async fn stats(&self) -> SyncResult<EngineStats> {
        let s = self.sched.stats();
        Ok(EngineStats {
            queue_pending: s.queue_pending,
            queue_dropped: s.queue_dropped,
            degraded: s.degraded,
            owned_scopes: self.sched.owned_scopes().await.len(),
        })
    }
}

/// Canned responses for frontend tests.
#[derive(Default)]
pub struct MockApi {
    pub statuses: Mutex<Vec<(ResourceKey, SyncStatus)>>,
    pub stats: Mutex<EngineStats>,
    pub resyncs: Mutex<Vec<ResourceKey>>,
}

impl MockApi {
    pub fn new() -> Arc<MockApi> {
        Arc::new(MockApi::default())
    }
}

#[async_trait::async_trait]
impl FabricaApi for MockApi {
    async fn status(&self, key: &ResourceKey) -> SyncResult<SyncStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, s)| s.clone())
            .unwrap_or_default())
    }

    async fn statuses(&self) -> SyncResult<Vec<(ResourceKey, SyncStatus)>> {
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn resync(&self, scope: &ResourceKey) -> SyncResult<usize> {
        self.resyncs.lock().unwrap().push(scope.clone());
        Ok(0)
    }

    async fn stats(&self) -> SyncResult<EngineStats> {
        Ok(self.stats.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fabrica_apply::{Applier, RetryPolicy};
    use fabrica_collector::{Collector, CollectorConfig};
    use fabrica_coord::MemCoordinator;
    use fabrica_core::{ModuloRootPlanner, SyncState};
    use fabrica_fabric::SimFabric;
    use fabrica_queue::EventQueue;
    use fabrica_sched::SchedConfig;
    use fabrica_store::DesiredStore;

    fn engine_api() -> Arc<EngineApi> {
        let sim = SimFabric::new();
        let queue = Arc::new(EventQueue::new(64, Duration::from_secs(5)));
        let collector = Collector::new(sim.clone(), queue.clone(), CollectorConfig::default());
        let sched = Scheduler::new(
            DesiredStore::in_memory(),
            collector,
            queue,
            Applier::new(sim, Duration::from_secs(1)),
            Arc::new(MemCoordinator::new()),
            ModuloRootPlanner::new(1),
            SchedConfig { retry: RetryPolicy::default(), ..SchedConfig::default() },
        );
        EngineApi::new(sched)
    }

    #[tokio::test]
    async fn engine_api_defaults() {
        let api = engine_api();
        let key = ResourceKey::root_for("a");
        assert_eq!(api.status(&key).await.unwrap().state, SyncState::Idle);
        assert!(api.statuses().await.unwrap().is_empty());
        let stats = api.stats().await.unwrap();
        assert_eq!(stats.queue_pending, 0);
        assert_eq!(stats.degraded, 0);
    }

    #[tokio::test]
    async fn mock_records_resyncs() {
        let mock = MockApi::new();
        let key = ResourceKey::root_for("a");
        mock.statuses
            .lock()
            .unwrap()
            .push((key.clone(), SyncStatus { state: SyncState::Degraded, last_error: None, attempts: 3 }));
        assert_eq!(mock.status(&key).await.unwrap().state, SyncState::Degraded);
        mock.resync(&key).await.unwrap();
        assert_eq!(mock.resyncs.lock().unwrap().as_slice(), &[key]);
    }
}
