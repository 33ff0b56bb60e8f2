//! Fabric controller boundary: the `FabricClient` trait, an HTTP
//! implementation, and an in-memory simulator used by tests and `--sim` runs.
//!
//! Idempotence is enforced at this boundary: create on an identical existing
//! object and delete on an absent object are no-op successes.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fabrica_core::{EventKind, Resource, ResourceKey, SyncError};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Failure classes reported by the fabric controller.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FabricError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl FabricError {
    /// Transient failures are retried with backoff; the rest are fatal for
    /// the offending resource until its desired definition changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::Timeout(_)
                | FabricError::Conflict(_)
                | FabricError::RateLimited(_)
                | FabricError::Transport(_)
        )
    }
}

impl From<FabricError> for SyncError {
    fn from(e: FabricError) -> SyncError {
        match &e {
            FabricError::Conflict(m) => SyncError::Conflict(m.clone()),
            FabricError::Malformed(m) | FabricError::Denied(m) => SyncError::Validation(m.clone()),
            _ if e.is_retryable() => SyncError::Transient(e.to_string()),
            _ => SyncError::Internal(e.to_string()),
        }
    }
}

/// Push notification emitted by the fabric for mutations it performs,
/// including out-of-band ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FabricEvent {
    pub key: ResourceKey,
    pub kind: EventKind,
    pub resource: Option<Resource>,
}

/// Long-lived push channel. Dropping or cancelling closes the stream; a
/// closed stream means the consumer must force a full poll before
/// resubscribing.
pub struct Subscription {
    rx: mpsc::Receiver<FabricEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<FabricEvent>, task: tokio::task::JoinHandle<()>) -> Self {
        Subscription { rx, task: Some(task) }
    }

    /// None when the channel is lost (disconnect or cancel).
    pub async fn recv(&mut self) -> Option<FabricEvent> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}

pub type FabricResult<T> = Result<T, FabricError>;

/// Object-level fabric controller API: read, create, update, delete,
/// subscribe. All calls are expected to block only on I/O and must be
/// wrapped in timeouts by the caller's configuration.
#[async_trait::async_trait]
pub trait FabricClient: Send + Sync {
    /// Full read of fabric state under `scope` (typically a tenant root).
    async fn poll(&self, scope: &ResourceKey) -> FabricResult<Vec<Resource>>;

    async fn get(&self, key: &ResourceKey) -> FabricResult<Option<Resource>>;

    async fn create(&self, resource: &Resource) -> FabricResult<()>;

    async fn update(&self, resource: &Resource) -> FabricResult<()>;

    async fn delete(&self, key: &ResourceKey) -> FabricResult<()>;

    async fn subscribe(&self, scope: &ResourceKey) -> FabricResult<Subscription>;
}

// ---------------- HTTP client ----------------

/// REST client for a live fabric controller. Subscriptions are a long-lived
/// NDJSON stream; the server emits one `FabricEvent` per line.
pub struct HttpFabricClient {
    base: String,
    http: reqwest::Client,
    queue_cap: usize,
}

impl HttpFabricClient {
    pub fn new(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(HttpFabricClient {
            base: base.trim_end_matches('/').to_string(),
            http,
            queue_cap: 2048,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn classify(op: &str, status: reqwest::StatusCode, body: String) -> FabricError {
        let msg = format!("{op}: {status}: {body}");
        match status.as_u16() {
            404 => FabricError::NotFound(msg),
            408 => FabricError::Timeout(msg),
            409 => FabricError::Conflict(msg),
            429 => FabricError::RateLimited(msg),
            400 | 422 => FabricError::Malformed(msg),
            401 | 403 => FabricError::Denied(msg),
            _ => FabricError::Transport(msg),
        }
    }

    fn transport(op: &str, e: reqwest::Error) -> FabricError {
        if e.is_timeout() {
            FabricError::Timeout(format!("{op}: {e}"))
        } else {
            FabricError::Transport(format!("{op}: {e}"))
        }
    }

    async fn check(op: &str, resp: reqwest::Response) -> FabricResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::classify(op, status, body))
    }
}

#[async_trait::async_trait]
impl FabricClient for HttpFabricClient {
    async fn poll(&self, scope: &ResourceKey) -> FabricResult<Vec<Resource>> {
        counter!("fabric_poll_total", 1u64);
        let resp = self
            .http
            .get(self.url("/objects"))
            .query(&[("scope", scope.as_str())])
            .send()
            .await
            .map_err(|e| Self::transport("poll", e))?;
        let resp = Self::check("poll", resp).await?;
        resp.json::<Vec<Resource>>()
            .await
            .map_err(|e| FabricError::Malformed(format!("poll body: {e}")))
    }

    async fn get(&self, key: &ResourceKey) -> FabricResult<Option<Resource>> {
        let resp = self
            .http
            .get(self.url(&format!("/objects/{}", key)))
            .send()
            .await
            .map_err(|e| Self::transport("get", e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check("get", resp).await?;
        let r = resp
            .json::<Resource>()
            .await
            .map_err(|e| FabricError::Malformed(format!("get body: {e}")))?;
        Ok(Some(r))
    }

    async fn create(&self, resource: &Resource) -> FabricResult<()> {
        counter!("fabric_create_total", 1u64);
        let resp = self
            .http
            .post(self.url("/objects"))
            .json(resource)
            .send()
            .await
            .map_err(|e| Self::transport("create", e))?;
        match Self::check("create", resp).await {
            Ok(_) => Ok(()),
            // Identical object already present is success for convergence.
            Err(FabricError::Conflict(_)) | Err(FabricError::AlreadyExists(_)) => {
                match self.get(&resource.key).await? {
                    Some(live) if live.same_config(resource) => Ok(()),
                    _ => Err(FabricError::Conflict(format!("create {}: exists with different config", resource.key))),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, resource: &Resource) -> FabricResult<()> {
        counter!("fabric_update_total", 1u64);
        let resp = self
            .http
            .put(self.url(&format!("/objects/{}", resource.key)))
            .json(resource)
            .send()
            .await
            .map_err(|e| Self::transport("update", e))?;
        Self::check("update", resp).await.map(|_| ())
    }

    async fn delete(&self, key: &ResourceKey) -> FabricResult<()> {
        counter!("fabric_delete_total", 1u64);
        let resp = self
            .http
            .delete(self.url(&format!("/objects/{}", key)))
            .send()
            .await
            .map_err(|e| Self::transport("delete", e))?;
        // Already absent is success for convergence.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check("delete", resp).await.map(|_| ())
    }

    async fn subscribe(&self, scope: &ResourceKey) -> FabricResult<Subscription> {
        use futures::StreamExt;
        let resp = self
            .http
            .get(self.url("/subscribe"))
            .query(&[("scope", scope.as_str())])
            // The stream body lives past the per-request timeout; connect
            // stays bounded by connect_timeout, and establishment as a
            // whole by the caller's deadline.
            .timeout(Duration::from_secs(u64::MAX / 4))
            .send()
            .await
            .map_err(|e| Self::transport("subscribe", e))?;
        let resp = Self::check("subscribe", resp).await?;
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let scope_str = scope.to_string();
        let task = tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(scope = %scope_str, error = %e, "subscription stream error");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<FabricEvent>(line) {
                        Ok(ev) => {
                            if tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(scope = %scope_str, error = %e, "skipping unparsable event line"),
                    }
                }
            }
            debug!(scope = %scope_str, "subscription stream ended");
        });
        info!(scope = %scope, "fabric subscription opened");
        Ok(Subscription::new(rx, task))
    }
}

// ---------------- Simulator ----------------

/// Fault script attached to a key in the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Classified retryable (conflict).
    Transient,
    /// Classified fatal (permission denial).
    Denied,
    /// The mutation stalls for this long before proceeding, so callers can
    /// exercise their timeouts.
    Stall(Duration),
}

struct Script {
    fault: Fault,
    /// None means fail forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct SimState {
    objects: FxHashMap<ResourceKey, Resource>,
    scripts: FxHashMap<ResourceKey, Script>,
    next_version: u64,
}

/// In-memory fabric controller. Mutations feed a broadcast channel so
/// subscriptions see the same out-of-band semantics as a live fabric.
pub struct SimFabric {
    state: Mutex<SimState>,
    events: broadcast::Sender<FabricEvent>,
}

impl SimFabric {
    pub fn new() -> Arc<SimFabric> {
        let (events, _) = broadcast::channel(4096);
        Arc::new(SimFabric { state: Mutex::new(SimState::default()), events })
    }

    /// Arrange for the next `times` mutations of `key` to fail. `None`
    /// means fail forever (until the script is cleared).
    pub fn inject_fault(&self, key: &ResourceKey, fault: Fault, times: Option<u32>) {
        let mut st = self.state.lock().unwrap();
        st.scripts.insert(key.clone(), Script { fault, remaining: times });
    }

    pub fn clear_fault(&self, key: &ResourceKey) {
        self.state.lock().unwrap().scripts.remove(key);
    }

    /// Mutate fabric state out-of-band, as an operator or another
    /// controller would. Emits a push event like any other mutation.
    pub fn mutate_out_of_band(&self, resource: Resource) {
        let mut st = self.state.lock().unwrap();
        st.next_version += 1;
        let mut r = resource;
        r.version = st.next_version;
        let kind = if st.objects.contains_key(&r.key) { EventKind::Updated } else { EventKind::Created };
        st.objects.insert(r.key.clone(), r.clone());
        drop(st);
        let _ = self.events.send(FabricEvent { key: r.key.clone(), kind, resource: Some(r) });
    }

    pub fn delete_out_of_band(&self, key: &ResourceKey) {
        let mut st = self.state.lock().unwrap();
        if st.objects.remove(key).is_some() {
            drop(st);
            let _ = self.events.send(FabricEvent { key: key.clone(), kind: EventKind::Deleted, resource: None });
        }
    }

    /// Everything currently in the fabric, sorted by key.
    pub fn dump(&self) -> Vec<Resource> {
        let st = self.state.lock().unwrap();
        let mut out: Vec<Resource> = st.objects.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().unwrap().objects.contains_key(key)
    }

    /// Consume one step of the key's fault script. Errors fail the
    /// mutation; `Ok(Some(d))` asks the caller to stall for `d` first.
    fn consume_script(&self, key: &ResourceKey, op: &str) -> FabricResult<Option<Duration>> {
        let mut st = self.state.lock().unwrap();
        let mut fired = None;
        let mut exhausted = false;
        if let Some(s) = st.scripts.get_mut(key) {
            match &mut s.remaining {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    fired = Some(s.fault);
                    exhausted = *n == 0;
                }
                Some(_) => exhausted = true,
                None => fired = Some(s.fault),
            }
        }
        if exhausted {
            st.scripts.remove(key);
        }
        match fired {
            Some(Fault::Transient) => {
                Err(FabricError::Conflict(format!("{op} {key}: injected transient fault")))
            }
            Some(Fault::Denied) => Err(FabricError::Denied(format!("{op} {key}: injected denial"))),
            Some(Fault::Stall(d)) => Ok(Some(d)),
            None => Ok(None),
        }
    }

    fn has_children(st: &SimState, key: &ResourceKey) -> bool {
        st.objects.keys().any(|k| key.is_ancestor_of(k))
    }
}

#[async_trait::async_trait]
impl FabricClient for SimFabric {
    async fn poll(&self, scope: &ResourceKey) -> FabricResult<Vec<Resource>> {
        let st = self.state.lock().unwrap();
        let mut out: Vec<Resource> = st
            .objects
            .values()
            .filter(|r| r.key.in_scope(scope))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn get(&self, key: &ResourceKey) -> FabricResult<Option<Resource>> {
        Ok(self.state.lock().unwrap().objects.get(key).cloned())
    }

    async fn create(&self, resource: &Resource) -> FabricResult<()> {
        if let Some(d) = self.consume_script(&resource.key, "create")? {
            tokio::time::sleep(d).await;
        }
        let ev = {
            let mut st = self.state.lock().unwrap();
            if let Some(live) = st.objects.get(&resource.key) {
                if live.same_config(resource) {
                    // Idempotent re-issue.
                    return Ok(());
                }
                return Err(FabricError::Conflict(format!(
                    "create {}: exists with different config",
                    resource.key
                )));
            }
            if let Some(parent) = resource.key.parent() {
                if !st.objects.contains_key(&parent) {
                    // Parent may still be in flight on another path.
                    return Err(FabricError::Conflict(format!(
                        "create {}: parent {parent} absent",
                        resource.key
                    )));
                }
            }
            st.next_version += 1;
            let mut r = resource.clone();
            r.version = st.next_version;
            st.objects.insert(r.key.clone(), r.clone());
            FabricEvent { key: r.key.clone(), kind: EventKind::Created, resource: Some(r) }
        };
        let _ = self.events.send(ev);
        Ok(())
    }

    async fn update(&self, resource: &Resource) -> FabricResult<()> {
        if let Some(d) = self.consume_script(&resource.key, "update")? {
            tokio::time::sleep(d).await;
        }
        let ev = {
            let mut st = self.state.lock().unwrap();
            let live = st
                .objects
                .get(&resource.key)
                .ok_or_else(|| FabricError::NotFound(format!("update {}", resource.key)))?;
            if live.same_config(resource) {
                return Ok(());
            }
            st.next_version += 1;
            let mut r = resource.clone();
            r.version = st.next_version;
            st.objects.insert(r.key.clone(), r.clone());
            FabricEvent { key: r.key.clone(), kind: EventKind::Updated, resource: Some(r) }
        };
        let _ = self.events.send(ev);
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> FabricResult<()> {
        if let Some(d) = self.consume_script(key, "delete")? {
            tokio::time::sleep(d).await;
        }
        let ev = {
            let mut st = self.state.lock().unwrap();
            if !st.objects.contains_key(key) {
                // Idempotent re-issue.
                return Ok(());
            }
            if Self::has_children(&st, key) {
                return Err(FabricError::Conflict(format!("delete {key}: children exist")));
            }
            st.objects.remove(key);
            FabricEvent { key: key.clone(), kind: EventKind::Deleted, resource: None }
        };
        let _ = self.events.send(ev);
        Ok(())
    }

    async fn subscribe(&self, scope: &ResourceKey) -> FabricResult<Subscription> {
        let mut feed = self.events.subscribe();
        let (tx, rx) = mpsc::channel(1024);
        let scope = scope.clone();
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(ev) => {
                        if !ev.key.in_scope(&scope) {
                            continue;
                        }
                        if tx.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events mean missed notifications; end the
                        // stream so the consumer forces a full poll.
                        warn!(scope = %scope, lagged = n, "sim subscription lagged; closing");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrica_core::ResourceKind;

    fn tenant(name: &str) -> Resource {
        Resource::new(ResourceKind::Tenant, ResourceKey::root_for(name))
    }

    fn bd(tn: &str, name: &str) -> Resource {
        let key = ResourceKey::root_for(tn).child(ResourceKind::BridgeDomain, name);
        Resource::new(ResourceKind::BridgeDomain, key)
    }

    #[tokio::test]
    async fn create_is_idempotent_on_identical() {
        let sim = SimFabric::new();
        let t = tenant("a");
        sim.create(&t).await.unwrap();
        sim.create(&t).await.unwrap();
        assert_eq!(sim.dump().len(), 1);
    }

    #[tokio::test]
    async fn create_conflicts_on_different_config() {
        let sim = SimFabric::new();
        sim.create(&tenant("a")).await.unwrap();
        let other = tenant("a").with_prop("descr", "x");
        let err = sim.create(&other).await.unwrap_err();
        assert!(matches!(err, FabricError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_absent_is_noop_and_parent_with_children_conflicts() {
        let sim = SimFabric::new();
        sim.delete(&ResourceKey::root_for("ghost")).await.unwrap();
        sim.create(&tenant("a")).await.unwrap();
        sim.create(&bd("a", "web")).await.unwrap();
        let err = sim.delete(&ResourceKey::root_for("a")).await.unwrap_err();
        assert!(matches!(err, FabricError::Conflict(_)));
        sim.delete(&bd("a", "web").key).await.unwrap();
        sim.delete(&ResourceKey::root_for("a")).await.unwrap();
        assert!(sim.dump().is_empty());
    }

    #[tokio::test]
    async fn orphan_create_conflicts() {
        let sim = SimFabric::new();
        let err = sim.create(&bd("a", "web")).await.unwrap_err();
        assert!(matches!(err, FabricError::Conflict(_)));
    }

    #[tokio::test]
    async fn subscription_sees_scoped_mutations() {
        let sim = SimFabric::new();
        let scope = ResourceKey::root_for("a");
        let mut sub = sim.subscribe(&scope).await.unwrap();
        sim.create(&tenant("a")).await.unwrap();
        sim.create(&tenant("b")).await.unwrap();
        sim.create(&bd("a", "web")).await.unwrap();
        let e1 = sub.recv().await.unwrap();
        assert_eq!(e1.key, scope);
        let e2 = sub.recv().await.unwrap();
        assert_eq!(e2.key, bd("a", "web").key);
    }

    #[tokio::test]
    async fn fault_script_fires_then_clears() {
        let sim = SimFabric::new();
        let t = tenant("a");
        sim.inject_fault(&t.key, Fault::Transient, Some(2));
        assert!(sim.create(&t).await.is_err());
        assert!(sim.create(&t).await.is_err());
        sim.create(&t).await.unwrap();
    }
}
