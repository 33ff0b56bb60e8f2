#![forbid(unsafe_code)]

use std::time::Duration;

use fabrica_core::{ChangeEvent, EventKind, Origin, ResourceKey};
use fabrica_queue::EventQueue;

fn ev(key: &str, kind: EventKind) -> ChangeEvent {
    ChangeEvent { key: ResourceKey::root_for(key), origin: Origin::Desired, kind, seq: 0 }
}

#[tokio::test]
async fn update_update_delete_collapses_to_delete() {
    let q = EventQueue::new(64, Duration::from_secs(5));
    q.enqueue(ev("t", EventKind::Updated));
    q.enqueue(ev("t", EventKind::Updated));
    q.enqueue(ev("t", EventKind::Deleted));
    assert_eq!(q.len(), 1);
    let d = q.dequeue().await;
    assert_eq!(d.kind, EventKind::Deleted);
    assert!(q.try_dequeue().is_none());
    q.ack(d.seq);
}

#[tokio::test]
async fn fifo_across_keys_and_seq_monotonic_per_key() {
    let q = EventQueue::new(64, Duration::from_secs(5));
    q.enqueue(ev("a", EventKind::Created));
    q.enqueue(ev("b", EventKind::Created));
    q.enqueue(ev("a", EventKind::Updated)); // coalesces, keeps a's slot first
    let d1 = q.dequeue().await;
    let d2 = q.dequeue().await;
    assert_eq!(d1.key, ResourceKey::root_for("a"));
    assert_eq!(d1.kind, EventKind::Updated);
    assert_eq!(d2.key, ResourceKey::root_for("b"));
    q.ack(d1.seq);
    q.ack(d2.seq);
    // a's next event carries a larger seq than its delivered one
    let s = q.enqueue(ev("a", EventKind::Deleted));
    assert!(s > d1.seq);
}

#[tokio::test]
async fn unacked_events_are_redelivered() {
    let q = EventQueue::new(64, Duration::from_millis(30));
    q.enqueue(ev("t", EventKind::Updated));
    let d1 = q.dequeue().await;
    // no ack; the event must come back after the timeout
    let d2 = q.dequeue().await;
    assert_eq!(d2.key, d1.key);
    assert_eq!(d2.kind, EventKind::Updated);
    assert_eq!(d2.seq, d1.seq);
    q.ack(d2.seq);
    // acked for good now
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(q.try_dequeue().is_none());
}

#[tokio::test]
async fn newer_pending_event_supersedes_redelivery() {
    let q = EventQueue::new(64, Duration::from_millis(20));
    q.enqueue(ev("t", EventKind::Updated));
    let d1 = q.dequeue().await;
    q.enqueue(ev("t", EventKind::Deleted));
    tokio::time::sleep(Duration::from_millis(40)).await;
    let d2 = q.dequeue().await;
    assert_eq!(d2.kind, EventKind::Deleted);
    assert!(d2.seq > d1.seq);
    assert!(q.try_dequeue().is_none());
    q.ack(d2.seq);
}

#[tokio::test]
async fn capacity_drops_oldest_pending() {
    let q = EventQueue::new(2, Duration::from_secs(5));
    q.enqueue(ev("a", EventKind::Created));
    q.enqueue(ev("b", EventKind::Created));
    q.enqueue(ev("c", EventKind::Created));
    assert_eq!(q.dropped(), 1);
    let d1 = q.dequeue().await;
    assert_eq!(d1.key, ResourceKey::root_for("b"));
}
