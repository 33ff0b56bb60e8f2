//! Fabrica replica coordination: time-bounded shard ownership.
//!
//! Each shard of resource keys is owned by at most one replica through a
//! lease. Expiry without renewal frees the shard for another replica; the
//! brief overlap during handoff is safe because every fabric operation is
//! idempotent.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabrica_core::ShardKey;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Ownership grant over one shard. The token ties renew/release calls to a
/// specific grant so a superseded lease cannot resurrect itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub shard: ShardKey,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    token: u64,
}

impl Lease {
    pub fn expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("shard {0:?} held by {1}")]
    Contention(ShardKey, String),
    #[error("lease expired or superseded")]
    Expired,
}

pub type CoordResult<T> = Result<T, CoordError>;

/// Lease authority. In-process for single-node and test deployments; a
/// shared-store implementation slots in behind the same trait for real
/// multi-replica clusters.
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    async fn acquire(&self, shard: ShardKey, replica: &str, ttl: Duration) -> CoordResult<Lease>;

    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> CoordResult<()>;

    async fn release(&self, lease: Lease) -> CoordResult<()>;

    /// Whether `replica` currently holds a live lease on `shard`.
    async fn held_by(&self, shard: ShardKey, replica: &str) -> bool;
}

struct Grant {
    holder: String,
    expires_at: DateTime<Utc>,
    token: u64,
}

/// Coordinator over a shared in-memory lease table. Clone-free: share via
/// `Arc`; multiple replica handles in one process model a cluster in tests.
pub struct MemCoordinator {
    table: Mutex<(FxHashMap<ShardKey, Grant>, u64)>,
}

impl MemCoordinator {
    pub fn new() -> Self {
        MemCoordinator { table: Mutex::new((FxHashMap::default(), 0)) }
    }
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Coordinator for MemCoordinator {
    async fn acquire(&self, shard: ShardKey, replica: &str, ttl: Duration) -> CoordResult<Lease> {
        let mut guard = self.table.lock().unwrap();
        let (table, next_token) = &mut *guard;
        let now = Utc::now();
        if let Some(g) = table.get(&shard) {
            if g.expires_at > now && g.holder != replica {
                return Err(CoordError::Contention(shard, g.holder.clone()));
            }
        }
        *next_token += 1;
        let token = *next_token;
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        table.insert(shard, Grant { holder: replica.to_string(), expires_at, token });
        info!(bucket = shard.bucket, replica, "lease acquired");
        Ok(Lease { shard, holder: replica.to_string(), expires_at, token })
    }

    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> CoordResult<()> {
        let mut guard = self.table.lock().unwrap();
        let (table, _) = &mut *guard;
        let now = Utc::now();
        match table.get_mut(&lease.shard) {
            Some(g) if g.token == lease.token && g.expires_at > now => {
                g.expires_at =
                    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
                lease.expires_at = g.expires_at;
                debug!(bucket = lease.shard.bucket, holder = %lease.holder, "lease renewed");
                Ok(())
            }
            _ => Err(CoordError::Expired),
        }
    }

    async fn release(&self, lease: Lease) -> CoordResult<()> {
        let mut guard = self.table.lock().unwrap();
        let (table, _) = &mut *guard;
        if let Some(g) = table.get(&lease.shard) {
            if g.token == lease.token {
                table.remove(&lease.shard);
                info!(bucket = lease.shard.bucket, holder = %lease.holder, "lease released");
            }
        }
        Ok(())
    }

    async fn held_by(&self, shard: ShardKey, replica: &str) -> bool {
        let guard = self.table.lock().unwrap();
        match guard.0.get(&shard) {
            Some(g) => g.holder == replica && g.expires_at > Utc::now(),
            None => false,
        }
    }
}
