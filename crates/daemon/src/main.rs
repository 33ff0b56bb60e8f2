//! fabricad: drives the fabric toward the desired state until told to stop.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use fabrica_api::{EngineApi, FabricaApi};
use fabrica_apply::{Applier, RetryPolicy};
use fabrica_collector::{Collector, CollectorConfig};
use fabrica_coord::{CoordError, Coordinator, Lease, MemCoordinator};
use fabrica_core::{ModuloRootPlanner, ResourceKey, ShardKey};
use fabrica_fabric::{FabricClient, HttpFabricClient, SimFabric};
use fabrica_queue::EventQueue;
use fabrica_sched::{SchedConfig, Scheduler};
use fabrica_store::DesiredStore;
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fabricad", version, about = "Fabrica reconciliation daemon")]
struct Cli {
    /// Fabric controller endpoint, e.g. http://fabric.example:8443
    #[arg(long, env = "FABRICA_ENDPOINT")]
    endpoint: Option<String>,

    /// Run against an in-process sim fabric instead of a controller
    #[arg(long, action = ArgAction::SetTrue)]
    sim: bool,

    /// Replica identity for lease ownership; generated when omitted
    #[arg(long, env = "FABRICA_REPLICA")]
    replica: Option<String>,

    /// Shard count for tenant-root partitioning
    #[arg(long, env = "FABRICA_SHARDS", default_value_t = 16)]
    shards: usize,

    /// Reconcile worker pool size
    #[arg(long, env = "FABRICA_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Full-poll interval per scope (seconds)
    #[arg(long, env = "FABRICA_POLL_SECS", default_value_t = 60)]
    poll_secs: u64,

    /// Drift sweep interval (seconds)
    #[arg(long, env = "FABRICA_SWEEP_SECS", default_value_t = 300)]
    sweep_secs: u64,

    /// Lease duration (seconds); renewal runs at half this
    #[arg(long, env = "FABRICA_LEASE_SECS", default_value_t = 15)]
    lease_secs: u64,

    /// Un-acked event redelivery timeout (seconds)
    #[arg(long, env = "FABRICA_REDELIVER_SECS", default_value_t = 30)]
    redeliver_secs: u64,

    /// Event queue capacity (pending keys)
    #[arg(long, env = "FABRICA_QUEUE_CAP", default_value_t = 4096)]
    queue_cap: usize,

    #[arg(long, env = "FABRICA_RETRY_BASE_MS", default_value_t = 500)]
    retry_base_ms: u64,

    #[arg(long, env = "FABRICA_RETRY_MAX_SECS", default_value_t = 30)]
    retry_max_secs: u64,

    #[arg(long, env = "FABRICA_RETRY_ATTEMPTS", default_value_t = 8)]
    retry_attempts: u32,

    /// SQLite path for the desired store; in-memory when omitted
    #[arg(long, env = "FABRICA_DB")]
    db: Option<String>,

    /// YAML document of desired resources loaded at startup
    #[arg(long, env = "FABRICA_SEED")]
    seed: Option<std::path::PathBuf>,

    /// Prometheus listen address, e.g. 127.0.0.1:9184
    #[arg(long = "metrics-addr", env = "FABRICA_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("FABRICA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid metrics addr; expected host:port");
        }
    }
}

/// Hold as many shards as contention allows: renew what we have, try to
/// pick up the rest, release everything on shutdown.
fn spawn_lease_manager(
    coord: Arc<dyn Coordinator>,
    planner: ModuloRootPlanner,
    replica: String,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut leases: Vec<Lease> = Vec::new();
        let mut ticker = tokio::time::interval(ttl / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let mut kept = Vec::with_capacity(leases.len());
                    for mut lease in leases.drain(..) {
                        let bucket = lease.shard.bucket;
                        match coord.renew(&mut lease, ttl).await {
                            Ok(()) => kept.push(lease),
                            Err(e) => warn!(bucket, error = %e, "lease renewal failed"),
                        }
                    }
                    leases = kept;
                    let held: FxHashSet<ShardKey> = leases.iter().map(|l| l.shard).collect();
                    for shard in planner.all_shards() {
                        if held.contains(&shard) {
                            continue;
                        }
                        match coord.acquire(shard, &replica, ttl).await {
                            Ok(lease) => leases.push(lease),
                            Err(CoordError::Contention(..)) => {}
                            Err(e) => warn!(bucket = shard.bucket, error = %e, "lease acquire failed"),
                        }
                    }
                }
            }
        }
        for lease in leases {
            let _ = coord.release(lease).await;
        }
        info!("leases released");
    })
}

/// Keep one collector task per tenant root, picking up roots that appear
/// after startup.
fn spawn_scope_supervisor(
    collector: Arc<Collector>,
    store: Arc<DesiredStore>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut sd = shutdown.clone();
    tokio::spawn(async move {
        let mut serving: FxHashSet<ResourceKey> = FxHashSet::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = sd.changed() => break,
                _ = ticker.tick() => {
                    for root in store.snapshot().roots() {
                        if serving.insert(root.clone()) {
                            collector.spawn_scope(root, shutdown.clone());
                        }
                    }
                }
            }
        }
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    let client: Arc<dyn FabricClient> = if cli.sim {
        info!("running against the in-process sim fabric");
        SimFabric::new()
    } else {
        let endpoint = cli
            .endpoint
            .as_deref()
            .context("either --endpoint or --sim is required")?;
        Arc::new(HttpFabricClient::new(endpoint, Duration::from_secs(10))?)
    };

    let store = match cli.db.as_deref() {
        Some(path) => DesiredStore::open(path)?,
        None => DesiredStore::in_memory(),
    };
    if let Some(seed) = &cli.seed {
        let doc = std::fs::read_to_string(seed)
            .with_context(|| format!("reading seed {}", seed.display()))?;
        let n = store.load_yaml(&doc)?;
        info!(records = n, seed = %seed.display(), "desired state seeded");
    }

    let replica = cli
        .replica
        .clone()
        .unwrap_or_else(|| format!("fabricad-{}", uuid::Uuid::new_v4()));
    let planner = ModuloRootPlanner::new(cli.shards);
    let queue = Arc::new(EventQueue::new(
        cli.queue_cap,
        Duration::from_secs(cli.redeliver_secs),
    ));
    let collector = Collector::new(
        Arc::clone(&client),
        Arc::clone(&queue),
        CollectorConfig {
            poll_interval: Duration::from_secs(cli.poll_secs),
            ..CollectorConfig::default()
        },
    );
    let coord: Arc<dyn Coordinator> = Arc::new(MemCoordinator::new());
    let retry = RetryPolicy {
        base: Duration::from_millis(cli.retry_base_ms),
        max: Duration::from_secs(cli.retry_max_secs),
        max_attempts: cli.retry_attempts,
        ..RetryPolicy::default()
    };
    let sched = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&collector),
        Arc::clone(&queue),
        Applier::new(Arc::clone(&client), Duration::from_secs(10)),
        Arc::clone(&coord),
        planner,
        SchedConfig {
            workers: cli.workers,
            sweep_interval: Duration::from_secs(cli.sweep_secs),
            retry,
            replica: replica.clone(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let lease_handle = spawn_lease_manager(
        Arc::clone(&coord),
        planner,
        replica.clone(),
        Duration::from_secs(cli.lease_secs),
        shutdown_rx.clone(),
    );
    let scope_handle = spawn_scope_supervisor(
        Arc::clone(&collector),
        Arc::clone(&store),
        Duration::from_secs(1).max(Duration::from_secs(cli.poll_secs / 4)),
        shutdown_rx.clone(),
    );
    let worker_handles = sched.spawn(shutdown_rx.clone());

    // Periodic heartbeat through the same facade frontends use.
    let api = EngineApi::new(Arc::clone(&sched));
    let heartbeat = {
        let api = Arc::clone(&api);
        let mut sd = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.reset();
            loop {
                tokio::select! {
                    _ = sd.changed() => break,
                    _ = ticker.tick() => match api.stats().await {
                        Ok(s) => info!(
                            pending = s.queue_pending,
                            dropped = s.queue_dropped,
                            degraded = s.degraded,
                            scopes = s.owned_scopes,
                            "engine heartbeat"
                        ),
                        Err(e) => warn!(error = %e, "heartbeat stats failed"),
                    },
                }
            }
        })
    };

    info!(replica = %replica, shards = cli.shards, workers = cli.workers, "fabricad up");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested; draining");
    let _ = shutdown_tx.send(true);

    for h in worker_handles {
        if let Err(e) = h.await {
            error!(error = %e, "worker task panicked");
        }
    }
    let _ = heartbeat.await;
    let _ = scope_handle.await;
    let _ = lease_handle.await;
    info!("fabricad stopped");
    Ok(())
}
