//! End-to-end reconcile cycles against the in-process sim fabric: desired
//! writes converge onto the fabric, drift heals, failures retry or park.

use std::sync::Arc;
use std::time::Duration;

use fabrica_apply::{Applier, RetryPolicy};
use fabrica_collector::{Collector, CollectorConfig};
use fabrica_coord::{Coordinator, MemCoordinator};
use fabrica_core::{ModuloRootPlanner, Resource, ResourceKey, ShardKey, SyncState};
use fabrica_fabric::{Fault, SimFabric};
use fabrica_queue::EventQueue;
use fabrica_sched::{SchedConfig, Scheduler};
use fabrica_store::DesiredStore;
use tokio::sync::watch;

fn res(key: &str) -> Resource {
    let key = ResourceKey::parse(key).unwrap();
    let kind = key.kind().unwrap();
    Resource::new(kind, key)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_frac: 0.0,
        max_attempts: 5,
    }
}

struct Rig {
    sim: Arc<SimFabric>,
    store: Arc<DesiredStore>,
    sched: Arc<Scheduler>,
    coord: Arc<MemCoordinator>,
    _shutdown: watch::Sender<bool>,
}

async fn rig_with(retry: RetryPolicy, hold_lease: bool) -> Rig {
    let sim = SimFabric::new();
    let queue = Arc::new(EventQueue::new(1024, Duration::from_secs(30)));
    let store = DesiredStore::in_memory();
    let collector = Collector::new(
        sim.clone(),
        queue.clone(),
        CollectorConfig {
            // only explicit polls in these tests
            poll_interval: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(1),
            resubscribe_backoff: Duration::from_millis(50),
        },
    );
    let applier = Applier::new(sim.clone(), Duration::from_secs(1));
    let coord = Arc::new(MemCoordinator::new());
    if hold_lease {
        coord
            .acquire(ShardKey { bucket: 0 }, "r1", Duration::from_secs(3600))
            .await
            .unwrap();
    }
    let cfg = SchedConfig {
        workers: 2,
        sweep_interval: Duration::from_secs(3600),
        retry,
        replica: "r1".to_string(),
    };
    let sched = Scheduler::new(
        store.clone(),
        collector,
        queue,
        applier,
        coord.clone(),
        ModuloRootPlanner::new(1),
        cfg,
    );
    let (tx, rx) = watch::channel(false);
    let _handles = sched.spawn(rx);
    Rig { sim, store, sched, coord, _shutdown: tx }
}

async fn rig() -> Rig {
    rig_with(fast_retry(), true).await
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn create_hierarchy_converges_to_idle() {
    let r = rig().await;
    let root = ResourceKey::root_for("t");
    let bd = ResourceKey::parse("tn-t/bd-bd1").unwrap();
    r.store.put(res("tn-t")).unwrap();
    r.store.put(res("tn-t/bd-bd1").with_prop("vrf", "main")).unwrap();

    let sim = r.sim.clone();
    let (c1, c2) = (bd.clone(), root.clone());
    wait_for("fabric to hold the hierarchy", move || {
        sim.contains(&c2) && sim.contains(&c1)
    })
    .await;
    let sched = r.sched.clone();
    let root2 = root.clone();
    wait_for("scope to settle idle", move || {
        sched.stats().queue_pending == 0 && sched.registry().get(&root2).state == SyncState::Idle
    })
    .await;
    assert_eq!(r.sched.registry().get(&bd).state, SyncState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_subtree_converges_and_purges() {
    let r = rig().await;
    let root = ResourceKey::root_for("t");
    let bd = ResourceKey::parse("tn-t/bd-bd1").unwrap();
    r.store.put(res("tn-t")).unwrap();
    r.store.put(res("tn-t/bd-bd1")).unwrap();
    r.store.put(res("tn-t/bd-bd1/subnet-10.0.0.0_24")).unwrap();
    {
        let sim = r.sim.clone();
        let k = ResourceKey::parse("tn-t/bd-bd1/subnet-10.0.0.0_24").unwrap();
        wait_for("subtree applied", move || sim.contains(&k)).await;
    }

    r.store.mark_deleting(&bd).unwrap();
    {
        let sim = r.sim.clone();
        let store = r.store.clone();
        let bd2 = bd.clone();
        wait_for("subtree torn down and purged", move || {
            !sim.contains(&bd2) && store.get(&bd2).is_none()
        })
        .await;
    }
    // the parent survives both in the fabric and in the store
    assert!(r.sim.contains(&root));
    assert!(r.store.get(&root).is_some());
    assert!(r.store.get(&ResourceKey::parse("tn-t/bd-bd1/subnet-10.0.0.0_24").unwrap()).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_faults_retry_until_success() {
    let r = rig().await;
    let root = ResourceKey::root_for("t");
    r.sim.inject_fault(&root, Fault::Transient, Some(2));
    r.store.put(res("tn-t")).unwrap();

    let sim = r.sim.clone();
    let k = root.clone();
    wait_for("create to land after retries", move || sim.contains(&k)).await;
    let sched = r.sched.clone();
    let k = root.clone();
    wait_for("status back to idle", move || {
        sched.registry().get(&k).state == SyncState::Idle
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_degrade_until_desired_changes() {
    let r = rig_with(
        RetryPolicy { max_attempts: 2, ..fast_retry() },
        true,
    )
    .await;
    let root = ResourceKey::root_for("t");
    r.sim.inject_fault(&root, Fault::Transient, None);
    r.store.put(res("tn-t")).unwrap();

    {
        let sched = r.sched.clone();
        let k = root.clone();
        wait_for("scope to degrade", move || {
            sched.registry().get(&k).state == SyncState::Degraded
        })
        .await;
    }
    let st = r.sched.registry().get(&root);
    assert!(st.last_error.is_some());
    assert_eq!(r.sched.stats().degraded, 1);
    assert!(!r.sim.contains(&root));

    // a new desired definition readmits the key
    r.sim.clear_fault(&root);
    r.store.put(res("tn-t").with_prop("descr", "second try")).unwrap();
    let sim = r.sim.clone();
    let k = root.clone();
    wait_for("readmitted create to land", move || sim.contains(&k)).await;
    let sched = r.sched.clone();
    let k = root.clone();
    wait_for("status back to idle", move || {
        sched.registry().get(&k).state == SyncState::Idle
    })
    .await;
    assert_eq!(r.sched.stats().degraded, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_failure_parks_key_but_siblings_converge() {
    let r = rig().await;
    let bad = ResourceKey::parse("tn-t/bd-bad").unwrap();
    let good = ResourceKey::parse("tn-t/bd-good").unwrap();
    r.sim.inject_fault(&bad, Fault::Denied, None);
    r.store.put(res("tn-t")).unwrap();
    r.store.put(res("tn-t/bd-bad")).unwrap();
    r.store.put(res("tn-t/bd-good")).unwrap();

    let sim = r.sim.clone();
    let g = good.clone();
    wait_for("sibling to land", move || sim.contains(&g)).await;
    {
        let sched = r.sched.clone();
        let b = bad.clone();
        wait_for("bad key to park", move || {
            sched.registry().get(&b).state == SyncState::Degraded
        })
        .await;
    }
    assert!(!r.sim.contains(&bad));
    // the rest of the tenant settles despite the parked key
    let sched = r.sched.clone();
    let root = ResourceKey::root_for("t");
    let k = root.clone();
    wait_for("tenant root to settle", move || {
        sched.registry().get(&k).state == SyncState::Idle
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_band_drift_heals_on_resync() {
    let r = rig().await;
    let root = ResourceKey::root_for("t");
    r.store.put(res("tn-t")).unwrap();
    r.store.put(res("tn-t/bd-web")).unwrap();
    {
        let sim = r.sim.clone();
        let k = ResourceKey::parse("tn-t/bd-web").unwrap();
        wait_for("initial apply", move || sim.contains(&k)).await;
    }

    // rogue object appears, managed object vanishes
    r.sim.mutate_out_of_band(res("tn-t/epg-rogue"));
    r.sim.delete_out_of_band(&ResourceKey::parse("tn-t/bd-web").unwrap());
    r.sched.resync(&root).await.unwrap();

    let sim = r.sim.clone();
    wait_for("drift healed", move || {
        !sim.contains(&ResourceKey::parse("tn-t/epg-rogue").unwrap())
            && sim.contains(&ResourceKey::parse("tn-t/bd-web").unwrap())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn random_mutations_settle_to_equal_states() {
    use rand::Rng;
    let r = rig().await;
    let root = ResourceKey::root_for("t");
    r.store.put(res("tn-t")).unwrap();

    let bds = ["bd-a", "bd-b", "bd-c"];
    let mut rng = rand::thread_rng();
    for round in 0..20 {
        let bd = bds[rng.gen_range(0..bds.len())];
        let key = format!("tn-t/{bd}");
        match rng.gen_range(0..3) {
            0 => {
                let _ = r.store.put(res(&key).with_prop("round", &round.to_string()));
            }
            1 => {
                let _ = r.store.mark_deleting(&ResourceKey::parse(&key).unwrap());
            }
            _ => {
                // fabric-side drift, healed by the next resync
                r.sim.mutate_out_of_band(res(&key).with_prop("rogue", "1"));
            }
        }
        if round % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // one sweep-equivalent resync, then both sides must agree
    tokio::time::sleep(Duration::from_millis(300)).await;
    r.sched.resync(&root).await.unwrap();
    let sim = r.sim.clone();
    let store = r.store.clone();
    let scope = root.clone();
    wait_for("states to settle equal", move || {
        let want: Vec<(String, _)> = store
            .snapshot()
            .subtree(&scope)
            .into_iter()
            .map(|r| (r.key.as_str().to_string(), r.props))
            .collect();
        let have: Vec<(String, _)> = sim
            .dump()
            .into_iter()
            .map(|r| (r.key.as_str().to_string(), r.props))
            .collect();
        want == have
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unowned_shard_takes_no_action() {
    let r = rig_with(fast_retry(), false).await;
    let root = ResourceKey::root_for("t");
    r.store.put(res("tn-t")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!r.sim.contains(&root));
    assert_eq!(r.sched.stats().queue_pending, 0);

    // acquiring the lease and forcing a resync picks the work back up
    r.coord
        .acquire(ShardKey { bucket: 0 }, "r1", Duration::from_secs(3600))
        .await
        .unwrap();
    r.sched.resync(&root).await.unwrap();
    let sim = r.sim.clone();
    let k = root.clone();
    wait_for("create to land once owned", move || sim.contains(&k)).await;
}
