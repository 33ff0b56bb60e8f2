//! Fabrica core types: resource model, change events, operations, errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type Seq = u64;

/// Closed set of fabric object types. Each kind knows its parent kind,
/// which fixes the dependency order for creates and deletes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tenant,
    BridgeDomain,
    Subnet,
    EndpointGroup,
    Endpoint,
    Contract,
    Filter,
}

impl ResourceKind {
    pub fn parent_kind(self) -> Option<ResourceKind> {
        match self {
            ResourceKind::Tenant => None,
            ResourceKind::BridgeDomain
            | ResourceKind::EndpointGroup
            | ResourceKind::Contract
            | ResourceKind::Filter => Some(ResourceKind::Tenant),
            ResourceKind::Subnet => Some(ResourceKind::BridgeDomain),
            ResourceKind::Endpoint => Some(ResourceKind::EndpointGroup),
        }
    }

    /// Path segment prefix, e.g. `bd` in `tn-green/bd-web`.
    pub fn prefix(self) -> &'static str {
        match self {
            ResourceKind::Tenant => "tn",
            ResourceKind::BridgeDomain => "bd",
            ResourceKind::Subnet => "subnet",
            ResourceKind::EndpointGroup => "epg",
            ResourceKind::Endpoint => "ep",
            ResourceKind::Contract => "brc",
            ResourceKind::Filter => "flt",
        }
    }

    pub fn from_prefix(p: &str) -> Option<ResourceKind> {
        match p {
            "tn" => Some(ResourceKind::Tenant),
            "bd" => Some(ResourceKind::BridgeDomain),
            "subnet" => Some(ResourceKind::Subnet),
            "epg" => Some(ResourceKind::EndpointGroup),
            "ep" => Some(ResourceKind::Endpoint),
            "brc" => Some(ResourceKind::Contract),
            "flt" => Some(ResourceKind::Filter),
            _ => None,
        }
    }

    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Tenant,
            ResourceKind::BridgeDomain,
            ResourceKind::Subnet,
            ResourceKind::EndpointGroup,
            ResourceKind::Endpoint,
            ResourceKind::Contract,
            ResourceKind::Filter,
        ]
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Tenant-scoped slash path identifying one fabric object, e.g.
/// `tn-green/bd-web/subnet-10.0.0.0_24`. Segment prefixes encode the kind.
///
/// Lexicographic order sorts a parent before its children, which the differ
/// uses only as a deterministic tiebreak; dependency order comes from the
/// parent chain itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn root_for(tenant: &str) -> ResourceKey {
        ResourceKey(format!("tn-{}", tenant))
    }

    /// Parse and validate a full path: every segment must carry a known
    /// prefix and the kind chain must match the model's parent relation.
    pub fn parse(s: &str) -> Result<ResourceKey, SyncError> {
        let mut expected_parent: Option<ResourceKind> = None;
        if s.is_empty() {
            return Err(SyncError::Validation("empty resource key".into()));
        }
        for seg in s.split('/') {
            let (prefix, name) = seg
                .split_once('-')
                .ok_or_else(|| SyncError::Validation(format!("malformed segment: {seg}")))?;
            if name.is_empty() {
                return Err(SyncError::Validation(format!("empty name in segment: {seg}")));
            }
            let kind = ResourceKind::from_prefix(prefix)
                .ok_or_else(|| SyncError::Validation(format!("unknown prefix: {prefix}")))?;
            if kind.parent_kind() != expected_parent {
                return Err(SyncError::Validation(format!(
                    "segment {seg} not valid under {:?}",
                    expected_parent
                )));
            }
            expected_parent = Some(kind);
        }
        Ok(ResourceKey(s.to_string()))
    }

    pub fn child(&self, kind: ResourceKind, name: &str) -> ResourceKey {
        ResourceKey(format!("{}/{}-{}", self.0, kind.prefix(), name))
    }

    pub fn parent(&self) -> Option<ResourceKey> {
        self.0.rsplit_once('/').map(|(p, _)| ResourceKey(p.to_string()))
    }

    /// Tenant root of this key (first segment).
    pub fn root(&self) -> ResourceKey {
        match self.0.split_once('/') {
            Some((r, _)) => ResourceKey(r.to_string()),
            None => self.clone(),
        }
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        let seg = self.0.rsplit('/').next()?;
        let (prefix, _) = seg.split_once('-')?;
        ResourceKind::from_prefix(prefix)
    }

    /// Leaf name without the kind prefix.
    pub fn name(&self) -> &str {
        let seg = self.0.rsplit('/').next().unwrap_or("");
        seg.split_once('-').map(|(_, n)| n).unwrap_or(seg)
    }

    pub fn is_ancestor_of(&self, other: &ResourceKey) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    pub fn in_scope(&self, scope: &ResourceKey) -> bool {
        self == scope || scope.is_ancestor_of(self)
    }

    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed, named fabric object. `version` is a monotonically increasing
/// revision stamp; it never participates in config comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub key: ResourceKey,
    pub props: BTreeMap<String, String>,
    pub version: u64,
}

impl Resource {
    pub fn new(kind: ResourceKind, key: ResourceKey) -> Resource {
        Resource { kind, key, props: BTreeMap::new(), version: 0 }
    }

    pub fn with_prop(mut self, k: &str, v: &str) -> Resource {
        self.props.insert(k.to_string(), v.to_string());
        self
    }

    /// Configuration equality: kind and properties, version ignored.
    pub fn same_config(&self, other: &Resource) -> bool {
        self.kind == other.kind && self.props == other.props
    }
}

/// The DSS's copy of a Resource. Soft-deleted via `deleting` until the
/// fabric confirms removal, then hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredRecord {
    pub resource: Resource,
    pub deleting: bool,
}

impl DesiredRecord {
    pub fn new(resource: Resource) -> DesiredRecord {
        DesiredRecord { resource, deleting: false }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Origin {
    Desired,
    Observed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    ResyncNeeded,
}

/// Normalized change notification. Applying the same event twice must not
/// change the outcome; consumers re-read state rather than trust payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: ResourceKey,
    pub origin: Origin,
    pub kind: EventKind,
    pub seq: Seq,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpVerb {
    Create,
    Update,
    Delete,
}

/// One idempotent step toward convergence. `deps` lists keys whose own
/// operations must commit first (parent creates, child deletes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub key: ResourceKey,
    pub verb: OpVerb,
    pub payload: Option<Resource>,
    pub deps: Vec<ResourceKey>,
}

/// Per-key scheduler state, exposed through the status surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Queued,
    Diffing,
    Applying,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_error: Option<String>,
    pub attempts: u32,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus { state: SyncState::Idle, last_error: None, attempts: 0 }
    }
}

/// Resource-scoped failure taxonomy. None of these crash the daemon; a
/// single resource's failure never blocks unrelated resources.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncError {
    /// Network/timeout/conflict against fabric or DSS; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Concurrent desired-state change during a cycle; re-queued, no partial apply.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Malformed desired definition; marked Degraded, never auto-retried.
    #[error("validation: {0}")]
    Validation(String),
    /// Lease expired mid-cycle; cycle abandoned for the next owner.
    #[error("coordination lost: {0}")]
    CoordinationLost(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

// ---- Shard planning ----

/// A partition of resource keys owned by one replica at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub bucket: u16,
}

/// Maps a tenant root to a shard. Implementations may bucket by hash or by
/// exact assignment; the scheduler only requires stability.
pub trait ShardPlanner: Send + Sync {
    fn plan(&self, root: &ResourceKey) -> ShardKey;
}

/// Default planner: FNV-1a hash of the tenant root modulo bucket count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModuloRootPlanner {
    buckets: u16,
}

impl ModuloRootPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.clamp(1, u16::MAX as usize) as u16 }
    }

    pub fn buckets(&self) -> u16 {
        self.buckets
    }

    pub fn all_shards(&self) -> impl Iterator<Item = ShardKey> {
        (0..self.buckets).map(|bucket| ShardKey { bucket })
    }
}

impl ShardPlanner for ModuloRootPlanner {
    fn plan(&self, root: &ResourceKey) -> ShardKey {
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        for b in root.as_str().as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        let bucket = if self.buckets <= 1 { 0 } else { (h as u16) % self.buckets };
        ShardKey { bucket }
    }
}

pub mod prelude {
    pub use super::{
        ChangeEvent, DesiredRecord, EventKind, ModuloRootPlanner, Operation, OpVerb, Origin,
        Resource, ResourceKey, ResourceKind, Seq, ShardKey, ShardPlanner, SyncError, SyncResult,
        SyncState, SyncStatus,
    };
}
