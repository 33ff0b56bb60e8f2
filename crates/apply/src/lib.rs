//! Fabrica applier: issues ordered, idempotent operations against the
//! fabric controller and classifies failures for the scheduler.
//!
//! One attempt per operation per reconciliation cycle; the scheduler owns
//! the retry ledger and uses `RetryPolicy::delay` for its backoff, so a
//! slow fabric call never stalls event intake.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fabrica_core::{Operation, OpVerb};
use fabrica_fabric::{FabricClient, FabricError};
use metrics::{counter, histogram};
use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApplyError {
    /// Transient (timeout, conflict, rate limit); safe to retry with backoff.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Malformed payload or permission denial; retrying cannot help until
    /// the desired definition changes.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Exponential backoff bounds, shared by the applier's callers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fractional jitter: a delay d becomes d * (1 ± jitter_frac).
    pub jitter_frac: f64,
    /// Attempts before a retryable failure escalates to fatal.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_frac: 0.2,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), capped and jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let jittered = if self.jitter_frac > 0.0 {
            let f = rand::thread_rng().gen_range(1.0 - self.jitter_frac..=1.0 + self.jitter_frac);
            capped * f
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64() * (1.0 + self.jitter_frac)))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

pub struct Applier {
    client: Arc<dyn FabricClient>,
    timeout: Duration,
}

impl Applier {
    pub fn new(client: Arc<dyn FabricClient>, timeout: Duration) -> Applier {
        Applier { client, timeout }
    }

    /// Execute one operation. Idempotence comes from the client boundary:
    /// re-issuing a committed create or delete is a no-op success.
    pub async fn apply(&self, op: &Operation) -> Result<(), ApplyError> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let res = tokio::time::timeout(self.timeout, self.issue(op)).await;
        let res = match res {
            Ok(r) => r,
            Err(_) => Err(FabricError::Timeout(format!("{:?} {}: deadline exceeded", op.verb, op.key))),
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("apply_ok", 1u64);
                debug!(key = %op.key, verb = ?op.verb, "operation committed");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                counter!("apply_err", 1u64);
                Err(ApplyError::Retryable(e.to_string()))
            }
            // An update hitting a vanished object is drift, not damage; the
            // next diff emits the create.
            Err(FabricError::NotFound(m)) => {
                counter!("apply_err", 1u64);
                Err(ApplyError::Retryable(m))
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(key = %op.key, verb = ?op.verb, error = %e, "fatal apply failure");
                Err(ApplyError::Fatal(e.to_string()))
            }
        }
    }

    /// Execute an ordered batch, stopping at the first failure. Returns how
    /// many operations committed so the caller can re-diff from reality.
    pub async fn apply_all(&self, ops: &[Operation]) -> (usize, Result<(), ApplyError>) {
        for (i, op) in ops.iter().enumerate() {
            if let Err(e) = self.apply(op).await {
                return (i, Err(e));
            }
        }
        (ops.len(), Ok(()))
    }

    async fn issue(&self, op: &Operation) -> Result<(), FabricError> {
        match op.verb {
            OpVerb::Create => {
                let payload = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| FabricError::Malformed(format!("create {}: no payload", op.key)))?;
                self.client.create(payload).await
            }
            OpVerb::Update => {
                let payload = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| FabricError::Malformed(format!("update {}: no payload", op.key)))?;
                self.client.update(payload).await
            }
            OpVerb::Delete => self.client.delete(&op.key).await,
        }
    }
}
