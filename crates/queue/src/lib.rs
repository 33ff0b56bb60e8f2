//! Fabrica event queue: keyed coalescing with FIFO order across keys,
//! at-least-once delivery, and timed redelivery of un-acked events.
//!
//! Only final state matters for convergence, so while multiple events for
//! one key are pending un-delivered, only the most recent kind is retained
//! (an update immediately followed by a delete collapses to the delete).
//! Consumers must be idempotent: a delivery that is never acked comes back.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fabrica_core::{ChangeEvent, ResourceKey, Seq};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct QueueInner {
    /// Coalesced events not yet delivered, one per key.
    pending: FxHashMap<ResourceKey, ChangeEvent>,
    /// FIFO order of keys in `pending`.
    order: VecDeque<ResourceKey>,
    /// Delivered but not yet acked, by seq.
    inflight: FxHashMap<Seq, (ChangeEvent, Instant)>,
    next_seq: Seq,
    dropped: u64,
}

/// Shared multi-producer multi-consumer queue. `enqueue` stamps sequence
/// numbers, so per-key delivery order is non-decreasing by construction.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    cap: usize,
    redeliver_after: Duration,
}

impl EventQueue {
    pub fn new(cap: usize, redeliver_after: Duration) -> Self {
        EventQueue {
            inner: Mutex::new(QueueInner {
                pending: FxHashMap::default(),
                order: VecDeque::new(),
                inflight: FxHashMap::default(),
                next_seq: 1,
                dropped: 0,
            }),
            notify: Notify::new(),
            cap: cap.max(1),
            redeliver_after,
        }
    }

    /// Number of keys pending delivery.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped under capacity pressure since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Stamp a fresh sequence number and coalesce into the pending set.
    pub fn enqueue(&self, mut ev: ChangeEvent) -> Seq {
        let seq;
        {
            let mut q = self.inner.lock().unwrap();
            seq = q.next_seq;
            q.next_seq += 1;
            ev.seq = seq;
            if !q.pending.contains_key(&ev.key) {
                if q.order.len() >= self.cap {
                    if let Some(old) = q.order.pop_front() {
                        q.pending.remove(&old);
                        q.dropped += 1;
                        counter!("queue_dropped_total", 1u64);
                        warn!(key = %old, "queue at capacity; dropped oldest pending key");
                    }
                }
                q.order.push_back(ev.key.clone());
            }
            // Latest kind wins while un-delivered.
            q.pending.insert(ev.key.clone(), ev);
        }
        counter!("queue_enqueued_total", 1u64);
        self.notify.notify_one();
        seq
    }

    /// Next event, blocking while the queue is empty. The returned event is
    /// in flight until `ack(seq)`; un-acked events are redelivered after the
    /// configured timeout.
    pub async fn dequeue(&self) -> ChangeEvent {
        loop {
            {
                let mut q = self.inner.lock().unwrap();
                self.requeue_expired(&mut q);
                if let Some(key) = q.order.pop_front() {
                    if let Some(ev) = q.pending.remove(&key) {
                        q.inflight.insert(ev.seq, (ev.clone(), Instant::now()));
                        return ev;
                    }
                }
            }
            // Wake on enqueue, or time out so redelivery scans still run.
            let _ = tokio::time::timeout(self.redeliver_after, self.notify.notified()).await;
        }
    }

    /// Non-blocking variant for drain loops and tests.
    pub fn try_dequeue(&self) -> Option<ChangeEvent> {
        let mut q = self.inner.lock().unwrap();
        self.requeue_expired(&mut q);
        let key = q.order.pop_front()?;
        let ev = q.pending.remove(&key)?;
        q.inflight.insert(ev.seq, (ev.clone(), Instant::now()));
        Some(ev)
    }

    /// Durably processed; the event will not be redelivered.
    pub fn ack(&self, seq: Seq) {
        let mut q = self.inner.lock().unwrap();
        if q.inflight.remove(&seq).is_none() {
            debug!(seq, "ack for unknown seq (already redelivered?)");
        }
    }

    fn requeue_expired(&self, q: &mut QueueInner) {
        if q.inflight.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<Seq> = q
            .inflight
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.redeliver_after)
            .map(|(s, _)| *s)
            .collect();
        for seq in expired {
            if let Some((ev, _)) = q.inflight.remove(&seq) {
                counter!("queue_redelivered_total", 1u64);
                // A newer pending event for the key supersedes the retry.
                if q.pending.contains_key(&ev.key) {
                    continue;
                }
                debug!(key = %ev.key, seq, "redelivering un-acked event");
                q.order.push_back(ev.key.clone());
                q.pending.insert(ev.key.clone(), ev);
            }
        }
    }
}
