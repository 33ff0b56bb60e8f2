//! Fabrica observed state collector.
//!
//! Two channels feed one normalized event stream: periodic full polls
//! (ground truth, drift backstop) and a push subscription per scope
//! (low-latency increments). Poll results are deduplicated against the
//! observed cache so downstream consumers only ever see actual deltas,
//! regardless of which channel noticed them first.
//!
//! Losing the subscription forces a full poll of the scope before
//! resubscribing; missed push events otherwise cause permanent drift.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use fabrica_core::{ChangeEvent, EventKind, Origin, Resource, ResourceKey, SyncError, SyncResult};
use fabrica_fabric::{FabricClient, FabricError, FabricEvent};
use fabrica_queue::EventQueue;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Point-in-time view of fabric-side state. Entirely derived; never
/// authoritative for intent, only for drift detection.
#[derive(Debug, Clone, Default)]
pub struct ObservedSnapshot {
    pub epoch: u64,
    pub records: FxHashMap<ResourceKey, Resource>,
}

impl ObservedSnapshot {
    /// Resources under `scope`, sorted by key.
    pub fn subtree(&self, scope: &ResourceKey) -> Vec<Resource> {
        let mut out: Vec<Resource> = self
            .records
            .values()
            .filter(|r| r.key.in_scope(scope))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

/// Observed cache with copy-on-read snapshots. Writers are the collector
/// loops; readers are reconciliation workers.
pub struct ObservedCache {
    snap: ArcSwap<ObservedSnapshot>,
    inner: Mutex<(FxHashMap<ResourceKey, Resource>, u64)>,
}

impl ObservedCache {
    pub fn new() -> Arc<ObservedCache> {
        Arc::new(ObservedCache {
            snap: ArcSwap::from_pointee(ObservedSnapshot::default()),
            inner: Mutex::new((FxHashMap::default(), 0)),
        })
    }

    pub fn snapshot(&self) -> Arc<ObservedSnapshot> {
        self.snap.load_full()
    }

    /// Replace everything under `scope` with a poll result; returns the
    /// synthetic events for observed deltas only.
    fn apply_poll(&self, scope: &ResourceKey, polled: Vec<Resource>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let mut guard = self.inner.lock().unwrap();
        let (records, epoch) = &mut *guard;
        let fresh: FxHashMap<ResourceKey, Resource> =
            polled.into_iter().map(|r| (r.key.clone(), r)).collect();
        let stale: Vec<ResourceKey> = records
            .keys()
            .filter(|k| k.in_scope(scope) && !fresh.contains_key(*k))
            .cloned()
            .collect();
        for k in stale {
            records.remove(&k);
            events.push(event(k, EventKind::Deleted));
        }
        for (k, r) in fresh {
            match records.get(&k) {
                Some(prev) if prev.same_config(&r) => {}
                Some(_) => {
                    records.insert(k.clone(), r);
                    events.push(event(k, EventKind::Updated));
                }
                None => {
                    records.insert(k.clone(), r);
                    events.push(event(k, EventKind::Created));
                }
            }
        }
        if !events.is_empty() {
            *epoch += 1;
            self.snap.store(Arc::new(ObservedSnapshot { epoch: *epoch, records: records.clone() }));
        }
        events
    }

    /// Patch one push event into the cache; None when it is a no-op
    /// (already seen via the other channel).
    fn apply_push(&self, ev: &FabricEvent) -> Option<ChangeEvent> {
        let mut guard = self.inner.lock().unwrap();
        let (records, epoch) = &mut *guard;
        let out = match (&ev.kind, &ev.resource) {
            (EventKind::Deleted, _) => {
                records.remove(&ev.key)?;
                Some(event(ev.key.clone(), EventKind::Deleted))
            }
            (_, Some(r)) => match records.get(&ev.key) {
                Some(prev) if prev.same_config(r) => None,
                Some(_) => {
                    records.insert(ev.key.clone(), r.clone());
                    Some(event(ev.key.clone(), EventKind::Updated))
                }
                None => {
                    records.insert(ev.key.clone(), r.clone());
                    Some(event(ev.key.clone(), EventKind::Created))
                }
            },
            // A push event with no payload and no deletion carries nothing
            // actionable; the next poll settles it.
            _ => None,
        };
        if out.is_some() {
            *epoch += 1;
            self.snap.store(Arc::new(ObservedSnapshot { epoch: *epoch, records: records.clone() }));
        }
        out
    }
}

fn event(key: ResourceKey, kind: EventKind) -> ChangeEvent {
    ChangeEvent { key, origin: Origin::Observed, kind, seq: 0 }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    /// Backoff between resubscription attempts after a disconnect.
    pub resubscribe_backoff: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            poll_interval: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            resubscribe_backoff: Duration::from_secs(2),
        }
    }
}

/// The collector: owns the observed cache and feeds the shared queue.
pub struct Collector {
    client: Arc<dyn FabricClient>,
    queue: Arc<EventQueue>,
    cache: Arc<ObservedCache>,
    cfg: CollectorConfig,
}

impl Collector {
    pub fn new(
        client: Arc<dyn FabricClient>,
        queue: Arc<EventQueue>,
        cfg: CollectorConfig,
    ) -> Arc<Collector> {
        Arc::new(Collector { client, queue, cache: ObservedCache::new(), cfg })
    }

    pub fn cache(&self) -> &Arc<ObservedCache> {
        &self.cache
    }

    /// One full poll of `scope`: dedupe against the cache, enqueue synthetic
    /// events for the deltas. Ground truth on startup, after disconnects,
    /// and on the periodic interval. Returns how many deltas were found.
    pub async fn poll_scope(&self, scope: &ResourceKey) -> SyncResult<usize> {
        let polled = tokio::time::timeout(self.cfg.call_timeout, self.client.poll(scope))
            .await
            .map_err(|_| SyncError::Transient(format!("poll {scope}: deadline exceeded")))?
            .map_err(SyncError::from)?;
        let events = self.cache.apply_poll(scope, polled);
        let n = events.len();
        for ev in events {
            self.queue.enqueue(ev);
        }
        counter!("collector_polls_total", 1u64);
        if n > 0 {
            debug!(scope = %scope, deltas = n, "poll found drift");
        }
        Ok(n)
    }

    /// Operator-initiated resync outside the timer cadence.
    pub async fn force_resync(&self, scope: &ResourceKey) -> SyncResult<usize> {
        info!(scope = %scope, "forced resync");
        counter!("collector_forced_resyncs_total", 1u64);
        self.poll_scope(scope).await
    }

    /// Serve one scope until shutdown: maintain the subscription, run the
    /// poll ticker, and force a full poll before every (re)subscribe so a
    /// dropped channel cannot leave permanent drift.
    pub fn spawn_scope(
        self: &Arc<Self>,
        scope: ResourceKey,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            info!(scope = %scope, "collector serving scope");
            'outer: loop {
                if *shutdown.borrow() {
                    break;
                }
                // Subscribe first so mutations during the priming poll are
                // not lost; the poll then reconciles any overlap.
                // Establishment is bounded; only the stream itself may
                // outlive the call deadline.
                let attempt =
                    match tokio::time::timeout(me.cfg.call_timeout, me.client.subscribe(&scope))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(FabricError::Timeout(format!(
                            "subscribe {scope}: deadline exceeded"
                        ))),
                    };
                let mut sub = match attempt {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "subscribe failed; backing off");
                        counter!("collector_resubscribes_total", 1u64);
                        tokio::select! {
                            _ = tokio::time::sleep(me.cfg.resubscribe_backoff) => continue 'outer,
                            _ = shutdown.changed() => break 'outer,
                        }
                    }
                };
                if let Err(e) = me.poll_scope(&scope).await {
                    warn!(scope = %scope, error = %e, "priming poll failed");
                }
                let mut ticker = tokio::time::interval(me.cfg.poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.reset();
                loop {
                    tokio::select! {
                        maybe = sub.recv() => match maybe {
                            Some(fev) => {
                                if let Some(ev) = me.cache.apply_push(&fev) {
                                    counter!("collector_push_events_total", 1u64);
                                    me.queue.enqueue(ev);
                                }
                            }
                            None => {
                                warn!(scope = %scope, "subscription lost; forcing full poll");
                                counter!("collector_resubscribes_total", 1u64);
                                tokio::time::sleep(me.cfg.resubscribe_backoff).await;
                                continue 'outer;
                            }
                        },
                        _ = ticker.tick() => {
                            if let Err(e) = me.poll_scope(&scope).await {
                                warn!(scope = %scope, error = %e, "periodic poll failed");
                            }
                        }
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            }
            info!(scope = %scope, "collector stopped for scope");
        })
    }
}
