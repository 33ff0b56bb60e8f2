//! Fabrica reconciliation scheduler.
//!
//! Workers drain the shared event queue and run full cycles per tenant
//! scope: snapshot desired and observed, diff, apply in dependency order,
//! then refresh observed state from the fabric so the next diff starts
//! from reality. Cycles are level-triggered; any burst of events for one
//! scope collapses into however many cycles it takes to reach an empty
//! diff.
//!
//! Failure handling is per scope and never blocks unrelated tenants:
//! retryable failures re-queue the scope with exponential backoff until
//! the attempt budget runs out, fatal failures park the offending key as
//! Degraded until its desired definition changes, and a lost lease
//! abandons the cycle for whichever replica owns the shard next.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabrica_apply::{Applier, ApplyError, RetryPolicy};
use fabrica_collector::Collector;
use fabrica_coord::Coordinator;
use fabrica_core::{
    ChangeEvent, EventKind, ModuloRootPlanner, Origin, ResourceKey, ShardPlanner, SyncError,
    SyncResult, SyncState, SyncStatus,
};
use fabrica_queue::EventQueue;
use fabrica_store::{DesiredSnapshot, DesiredStore};
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-key sync status surface. Keys with no entry are Idle; the registry
/// only materializes entries for keys the scheduler has touched.
pub struct StatusRegistry {
    map: Mutex<FxHashMap<ResourceKey, SyncStatus>>,
}

impl StatusRegistry {
    fn new() -> StatusRegistry {
        StatusRegistry { map: Mutex::new(FxHashMap::default()) }
    }

    pub fn get(&self, key: &ResourceKey) -> SyncStatus {
        self.map.lock().unwrap().get(key).cloned().unwrap_or_default()
    }

    /// All non-default statuses, sorted by key.
    pub fn all(&self) -> Vec<(ResourceKey, SyncStatus)> {
        let mut out: Vec<(ResourceKey, SyncStatus)> = self
            .map
            .lock()
            .unwrap()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn set_state(&self, key: &ResourceKey, state: SyncState) {
        let mut map = self.map.lock().unwrap();
        map.entry(key.clone()).or_default().state = state;
    }

    fn note_retry(&self, key: &ResourceKey, attempts: u32, error: &str) {
        let mut map = self.map.lock().unwrap();
        let st = map.entry(key.clone()).or_default();
        st.state = SyncState::Queued;
        st.attempts = attempts;
        st.last_error = Some(error.to_string());
    }

    fn degrade(&self, key: &ResourceKey, error: &str) {
        let mut map = self.map.lock().unwrap();
        let st = map.entry(key.clone()).or_default();
        st.state = SyncState::Degraded;
        st.last_error = Some(error.to_string());
    }

    /// Reset every key under `scope` to Idle except the ones in `keep`.
    fn reset_scope_except(&self, scope: &ResourceKey, keep: &FxHashSet<ResourceKey>) {
        let mut map = self.map.lock().unwrap();
        map.retain(|k, _| !k.in_scope(scope) || keep.contains(k));
    }
}

/// A fatally failed key, parked until its desired definition moves past
/// the version that failed. `None` means the key had no desired record
/// (a delete that was denied).
struct DegradedMark {
    desired_version: Option<u64>,
    error: String,
}

#[derive(Debug, Clone)]
pub struct SchedConfig {
    pub workers: usize,
    /// Cadence of the drift sweep that re-enqueues every owned scope.
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
    pub replica: String,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            workers: 4,
            sweep_interval: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            replica: "replica-0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedStats {
    pub queue_pending: usize,
    pub queue_dropped: u64,
    pub degraded: usize,
}

struct CycleOutcome {
    applied: usize,
    /// Operations were left unattempted after a fatal failure; the scope
    /// needs another cycle to finish the rest.
    incomplete: bool,
}

/// The scheduler. Share via `Arc`; `spawn` starts the worker pool plus the
/// desired-event forwarder and the periodic drift sweep.
pub struct Scheduler {
    store: Arc<DesiredStore>,
    collector: Arc<Collector>,
    queue: Arc<EventQueue>,
    applier: Applier,
    coord: Arc<dyn Coordinator>,
    planner: ModuloRootPlanner,
    cfg: SchedConfig,
    registry: StatusRegistry,
    /// Scopes with a cycle in flight; one cycle per scope at a time.
    inflight: Mutex<FxHashSet<ResourceKey>>,
    /// Scopes that took an event while in flight and need a follow-up.
    pending_rerun: Mutex<FxHashSet<ResourceKey>>,
    degraded: Mutex<FxHashMap<ResourceKey, DegradedMark>>,
    /// Consecutive retryable failures per scope.
    attempts: Mutex<FxHashMap<ResourceKey, u32>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<DesiredStore>,
        collector: Arc<Collector>,
        queue: Arc<EventQueue>,
        applier: Applier,
        coord: Arc<dyn Coordinator>,
        planner: ModuloRootPlanner,
        cfg: SchedConfig,
    ) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            store,
            collector,
            queue,
            applier,
            coord,
            planner,
            cfg,
            registry: StatusRegistry::new(),
            inflight: Mutex::new(FxHashSet::default()),
            pending_rerun: Mutex::new(FxHashSet::default()),
            degraded: Mutex::new(FxHashMap::default()),
            attempts: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            queue_pending: self.queue.len(),
            queue_dropped: self.queue.dropped(),
            degraded: self.degraded.lock().unwrap().len(),
        }
    }

    /// Start workers, the desired-event forwarder, and the drift sweep.
    /// Workers stop taking events once `shutdown` flips; cycles already in
    /// flight run to completion.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.cfg.workers + 2);
        for worker in 0..self.cfg.workers {
            let me = Arc::clone(self);
            let mut sd = shutdown.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "reconcile worker up");
                loop {
                    let ev = tokio::select! {
                        biased;
                        _ = sd.changed() => break,
                        ev = me.queue.dequeue() => ev,
                    };
                    me.handle_event(ev).await;
                }
                debug!(worker, "reconcile worker drained");
            }));
        }
        handles.push(self.spawn_forwarder(shutdown.clone()));
        handles.push(self.spawn_sweeper(shutdown));
        handles
    }

    /// Bridge the store's broadcast feed into the shared queue. A desired
    /// change is also what readmits a Degraded key, so the key is marked
    /// Queued here rather than waiting for a worker to pick it up.
    fn spawn_forwarder(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        // Subscribe before spawning so events emitted between `spawn` and the
        // task's first poll are not dropped by the broadcast channel.
        let mut rx = me.store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    r = rx.recv() => match r {
                        Ok(ev) => {
                            me.registry.set_state(&ev.key, SyncState::Queued);
                            me.queue.enqueue(ev);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "desired feed lagged; resyncing all roots");
                            for root in me.store.snapshot().roots() {
                                me.queue.enqueue(resync_event(root));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Periodic full sweep: re-enqueue every owned scope so drift the event
    /// channels missed is still bounded by the sweep interval.
    fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(me.cfg.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.reset();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let scopes = me.owned_scopes().await;
                        debug!(scopes = scopes.len(), "drift sweep");
                        counter!("sched_sweeps_total", 1u64);
                        for scope in scopes {
                            me.queue.enqueue(resync_event(scope));
                        }
                    }
                }
            }
        })
    }

    /// Tenant roots this replica currently holds a lease for, across both
    /// desired and observed state.
    pub async fn owned_scopes(&self) -> Vec<ResourceKey> {
        let mut roots = self.store.snapshot().roots();
        for key in self.collector.cache().snapshot().records.keys() {
            roots.push(key.root());
        }
        roots.sort();
        roots.dedup();
        let mut owned = Vec::with_capacity(roots.len());
        for root in roots {
            if self.coord.held_by(self.planner.plan(&root), &self.cfg.replica).await {
                owned.push(root);
            }
        }
        owned
    }

    /// Operator-initiated resync: clear parked failures under `scope`,
    /// force a fresh poll, and queue a cycle even if the poll saw no drift.
    pub async fn resync(&self, scope: &ResourceKey) -> SyncResult<usize> {
        {
            let mut degraded = self.degraded.lock().unwrap();
            degraded.retain(|k, _| !k.in_scope(scope));
        }
        self.attempts.lock().unwrap().remove(&scope.root());
        let n = self.collector.force_resync(scope).await?;
        self.queue.enqueue(resync_event(scope.root()));
        Ok(n)
    }

    async fn handle_event(self: &Arc<Self>, ev: ChangeEvent) {
        let scope = ev.key.root();
        let shard = self.planner.plan(&scope);
        if !self.coord.held_by(shard, &self.cfg.replica).await {
            debug!(key = %ev.key, bucket = shard.bucket, "event for unowned shard; dropping");
            self.queue.ack(ev.seq);
            return;
        }
        {
            let mut inflight = self.inflight.lock().unwrap();
            if inflight.contains(&scope) {
                self.pending_rerun.lock().unwrap().insert(scope.clone());
                self.queue.ack(ev.seq);
                return;
            }
            inflight.insert(scope.clone());
        }
        self.registry.set_state(&ev.key, SyncState::Diffing);

        let t0 = std::time::Instant::now();
        let outcome = self.reconcile_scope(&scope).await;
        histogram!("sched_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);

        self.inflight.lock().unwrap().remove(&scope);
        let rerun = self.pending_rerun.lock().unwrap().remove(&scope);
        match outcome {
            Ok(out) => {
                counter!("sched_cycles_total", 1u64);
                counter!("sched_ops_applied_total", out.applied as u64);
                self.attempts.lock().unwrap().remove(&scope);
                self.settle_scope(&scope);
                self.queue.ack(ev.seq);
                if rerun || out.incomplete {
                    self.queue.enqueue(resync_event(scope));
                }
            }
            Err(SyncError::CoordinationLost(m)) => {
                // No ack: redelivery re-evaluates once ownership settles.
                warn!(scope = %scope, "lease lost mid-cycle: {m}");
                counter!("sched_lease_losses_total", 1u64);
            }
            Err(SyncError::Conflict(m)) => {
                // Intent moved under us; run again with the fresh snapshot.
                debug!(scope = %scope, "cycle conflicted: {m}");
                self.registry.set_state(&scope, SyncState::Queued);
                self.queue.ack(ev.seq);
                self.queue.enqueue(resync_event(scope));
            }
            Err(e) => {
                counter!("sched_cycle_failures_total", 1u64);
                self.queue.ack(ev.seq);
                self.retry_or_degrade(&scope, &ev.key, &e);
            }
        }
    }

    fn retry_or_degrade(self: &Arc<Self>, scope: &ResourceKey, key: &ResourceKey, err: &SyncError) {
        let attempts = {
            let mut a = self.attempts.lock().unwrap();
            let n = a.entry(scope.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if self.cfg.retry.exhausted(attempts) {
            warn!(scope = %scope, attempts, error = %err, "retry budget exhausted; degrading");
            counter!("sched_degraded_total", 1u64);
            self.attempts.lock().unwrap().remove(scope);
            let version = self.store.get(scope).map(|r| r.resource.version);
            self.degraded.lock().unwrap().insert(
                scope.clone(),
                DegradedMark { desired_version: version, error: err.to_string() },
            );
            self.registry.degrade(scope, &err.to_string());
            return;
        }
        let delay = self.cfg.retry.delay(attempts - 1);
        debug!(scope = %scope, attempts, delay_ms = delay.as_millis() as u64, "cycle retry scheduled");
        self.registry.note_retry(key, attempts, &err.to_string());
        if key != scope {
            self.registry.note_retry(scope, attempts, &err.to_string());
        }
        let me = Arc::clone(self);
        let scope = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.queue.enqueue(resync_event(scope));
        });
    }

    /// One full reconcile cycle for a tenant scope.
    async fn reconcile_scope(&self, scope: &ResourceKey) -> SyncResult<CycleOutcome> {
        let shard = self.planner.plan(scope);
        if !self.coord.held_by(shard, &self.cfg.replica).await {
            return Err(SyncError::CoordinationLost(format!("not holding shard {}", shard.bucket)));
        }
        self.registry.set_state(scope, SyncState::Diffing);

        let desired = self.store.snapshot();
        let observed = self.collector.cache().snapshot();
        let want = desired.subtree(scope);
        let have = observed.subtree(scope);
        let mut ops = fabrica_diff::diff(&want, &have);
        self.filter_degraded(&desired, &mut ops);
        if ops.is_empty() {
            self.try_purge(scope);
            return Ok(CycleOutcome { applied: 0, incomplete: false });
        }

        // Abort before touching the fabric if intent moved since the
        // snapshot; the re-queued cycle diffs against the fresh state.
        let fresh = self.store.snapshot();
        if scope_fingerprint(&desired, scope) != scope_fingerprint(&fresh, scope) {
            return Err(SyncError::Conflict(format!("desired state changed under {scope}")));
        }

        self.registry.set_state(scope, SyncState::Applying);
        for op in &ops {
            self.registry.set_state(&op.key, SyncState::Applying);
        }
        info!(scope = %scope, ops = ops.len(), "applying diff");
        let (committed, res) = self.applier.apply_all(&ops).await;

        if !self.coord.held_by(shard, &self.cfg.replica).await {
            return Err(SyncError::CoordinationLost(format!(
                "shard {} lost after {committed} ops",
                shard.bucket
            )));
        }

        match res {
            Ok(()) => {
                self.refresh(scope).await;
                for op in &ops {
                    self.degraded.lock().unwrap().remove(&op.key);
                }
                self.try_purge(scope);
                Ok(CycleOutcome { applied: committed, incomplete: false })
            }
            Err(ApplyError::Retryable(m)) => {
                self.refresh(scope).await;
                Err(SyncError::Transient(m))
            }
            Err(ApplyError::Fatal(m)) => {
                let failed = &ops[committed];
                warn!(key = %failed.key, "operation parked as degraded: {m}");
                counter!("sched_degraded_total", 1u64);
                let version = self.store.get(&failed.key).map(|r| r.resource.version);
                self.degraded.lock().unwrap().insert(
                    failed.key.clone(),
                    DegradedMark { desired_version: version, error: m.clone() },
                );
                self.registry.degrade(&failed.key, &m);
                self.refresh(scope).await;
                Ok(CycleOutcome {
                    applied: committed,
                    incomplete: committed + 1 < ops.len(),
                })
            }
        }
    }

    /// Drop operations for keys parked as Degraded, unless the desired
    /// definition has moved past the version that failed.
    fn filter_degraded(&self, desired: &DesiredSnapshot, ops: &mut Vec<fabrica_core::Operation>) {
        let degraded = self.degraded.lock().unwrap();
        if degraded.is_empty() {
            return;
        }
        ops.retain(|op| match degraded.get(&op.key) {
            Some(mark) => {
                let current = desired.get(&op.key).map(|r| r.resource.version);
                current != mark.desired_version
            }
            None => true,
        });
    }

    /// Pull post-apply ground truth so the next diff starts from reality.
    /// Best-effort: a failed refresh just leaves the periodic poll to
    /// catch up.
    async fn refresh(&self, scope: &ResourceKey) {
        if let Err(e) = self.collector.poll_scope(scope).await {
            warn!(scope = %scope, error = %e, "post-apply refresh failed");
        }
    }

    /// Hard-delete soft-deleted records once the fabric confirms they are
    /// gone.
    fn try_purge(&self, scope: &ResourceKey) {
        let desired = self.store.snapshot();
        let deleting = desired.deleting_keys(scope);
        if deleting.is_empty() {
            return;
        }
        let observed = self.collector.cache().snapshot();
        if deleting.iter().any(|k| observed.records.contains_key(k)) {
            return;
        }
        match self.store.purge(scope) {
            Ok(n) if n > 0 => debug!(scope = %scope, purged = n, "confirmed deletions purged"),
            Ok(_) => {}
            Err(e) => warn!(scope = %scope, error = %e, "purge failed"),
        }
    }

    /// After a clean cycle, reset every status under the scope except keys
    /// still parked as Degraded.
    fn settle_scope(&self, scope: &ResourceKey) {
        let keep: FxHashSet<ResourceKey> =
            self.degraded.lock().unwrap().keys().cloned().collect();
        self.registry.reset_scope_except(scope, &keep);
        // A later event for a parked key may have flipped its surfaced state
        // (Queued/Diffing); the degraded map is the truth, so re-assert it.
        for key in keep.iter().filter(|k| k.in_scope(scope)) {
            self.registry.set_state(key, SyncState::Degraded);
        }
    }
}

fn resync_event(scope: ResourceKey) -> ChangeEvent {
    ChangeEvent { key: scope, origin: Origin::Observed, kind: EventKind::ResyncNeeded, seq: 0 }
}

/// Stable digest of a scope's desired records, for detecting concurrent
/// writes between snapshot and apply.
fn scope_fingerprint(snap: &DesiredSnapshot, scope: &ResourceKey) -> Vec<(ResourceKey, u64, bool)> {
    let mut out: Vec<(ResourceKey, u64, bool)> = snap
        .records
        .values()
        .filter(|r| r.resource.key.in_scope(scope))
        .map(|r| (r.resource.key.clone(), r.resource.version, r.deleting))
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_defaults_to_idle() {
        let reg = StatusRegistry::new();
        let key = ResourceKey::root_for("a");
        assert_eq!(reg.get(&key).state, SyncState::Idle);
        reg.note_retry(&key, 2, "boom");
        let st = reg.get(&key);
        assert_eq!(st.state, SyncState::Queued);
        assert_eq!(st.attempts, 2);
        assert_eq!(st.last_error.as_deref(), Some("boom"));
        reg.reset_scope_except(&key, &FxHashSet::default());
        assert_eq!(reg.get(&key).state, SyncState::Idle);
        assert!(reg.all().is_empty());
    }

    #[test]
    fn fingerprint_tracks_versions_and_deletion() {
        let store = DesiredStore::in_memory();
        let key = ResourceKey::root_for("a");
        let kind = key.kind().unwrap();
        store.put(fabrica_core::Resource::new(kind, key.clone())).unwrap();
        let a = scope_fingerprint(&store.snapshot(), &key);
        store
            .put(fabrica_core::Resource::new(kind, key.clone()).with_prop("descr", "x"))
            .unwrap();
        let b = scope_fingerprint(&store.snapshot(), &key);
        assert_ne!(a, b);
        store.mark_deleting(&key).unwrap();
        let c = scope_fingerprint(&store.snapshot(), &key);
        assert_ne!(b, c);
    }
}
