//! Fabrica desired state store (DSS): the source of truth for intent.
//!
//! Records are held in an ArcSwap snapshot so readers get copy-on-read
//! consistency while writes continue. Mutations go through the write path
//! only, bump a store-wide version stamp, emit Desired-origin change events,
//! and are mirrored to SQLite when a path is configured so intent survives
//! daemon restarts.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use fabrica_core::{
    ChangeEvent, DesiredRecord, EventKind, Origin, Resource, ResourceKey, ResourceKind, SyncError,
    SyncResult,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Point-in-time view of all desired records.
#[derive(Debug, Clone, Default)]
pub struct DesiredSnapshot {
    pub epoch: u64,
    pub records: FxHashMap<ResourceKey, DesiredRecord>,
}

impl DesiredSnapshot {
    pub fn get(&self, key: &ResourceKey) -> Option<&DesiredRecord> {
        self.records.get(key)
    }

    /// Live (not soft-deleted) resources under `scope`, sorted by key.
    pub fn subtree(&self, scope: &ResourceKey) -> Vec<Resource> {
        let mut out: Vec<Resource> = self
            .records
            .values()
            .filter(|r| !r.deleting && r.resource.key.in_scope(scope))
            .map(|r| r.resource.clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Keys under `scope` marked for deletion.
    pub fn deleting_keys(&self, scope: &ResourceKey) -> Vec<ResourceKey> {
        let mut out: Vec<ResourceKey> = self
            .records
            .values()
            .filter(|r| r.deleting && r.resource.key.in_scope(scope))
            .map(|r| r.resource.key.clone())
            .collect();
        out.sort();
        out
    }

    /// Tenant roots present in the store, deleting or not.
    pub fn roots(&self) -> Vec<ResourceKey> {
        let mut out: Vec<ResourceKey> = self
            .records
            .keys()
            .map(|k| k.root())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

struct Inner {
    records: FxHashMap<ResourceKey, DesiredRecord>,
    next_version: u64,
    epoch: u64,
}

/// The store. Cheap to share; all methods take `&self`.
pub struct DesiredStore {
    snap: ArcSwap<DesiredSnapshot>,
    inner: Mutex<Inner>,
    db: Option<Mutex<rusqlite::Connection>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl DesiredStore {
    /// In-memory store, nothing persisted.
    pub fn in_memory() -> Arc<DesiredStore> {
        Self::build(None).expect("in-memory store cannot fail")
    }

    /// SQLite-backed store; existing records are loaded on open.
    pub fn open(path: &str) -> anyhow::Result<Arc<DesiredStore>> {
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> anyhow::Result<Arc<DesiredStore>> {
        let (events, _) = broadcast::channel(4096);
        let mut records: FxHashMap<ResourceKey, DesiredRecord> = FxHashMap::default();
        let mut next_version = 1u64;
        let db = match path {
            Some(p) => {
                let conn = rusqlite::Connection::open(p)?;
                conn.pragma_update(None, "journal_mode", &"WAL").ok();
                conn.pragma_update(None, "synchronous", &"NORMAL").ok();
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS desired (
                        key      TEXT PRIMARY KEY,
                        kind     TEXT NOT NULL,
                        props    TEXT NOT NULL,
                        version  INTEGER NOT NULL,
                        deleting INTEGER NOT NULL
                    )",
                    [],
                )?;
                {
                    let mut stmt =
                        conn.prepare("SELECT key, kind, props, version, deleting FROM desired")?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        let key: String = row.get(0)?;
                        let kind: String = row.get(1)?;
                        let props: String = row.get(2)?;
                        let version: i64 = row.get(3)?;
                        let deleting: i64 = row.get(4)?;
                        let key = ResourceKey::parse(&key)
                            .map_err(|e| anyhow::anyhow!("bad key in db: {e}"))?;
                        let kind: ResourceKind = serde_json::from_value(serde_json::Value::String(kind))?;
                        let props: BTreeMap<String, String> = serde_json::from_str(&props)?;
                        next_version = next_version.max(version as u64 + 1);
                        records.insert(
                            key.clone(),
                            DesiredRecord {
                                resource: Resource { kind, key, props, version: version as u64 },
                                deleting: deleting != 0,
                            },
                        );
                    }
                }
                info!(path = %p, records = records.len(), "desired store opened");
                Some(Mutex::new(conn))
            }
            None => None,
        };
        let snap = DesiredSnapshot { epoch: 0, records: records.clone() };
        Ok(Arc::new(DesiredStore {
            snap: ArcSwap::from_pointee(snap),
            inner: Mutex::new(Inner { records, next_version, epoch: 0 }),
            db,
            events,
        }))
    }

    pub fn snapshot(&self) -> Arc<DesiredSnapshot> {
        self.snap.load_full()
    }

    /// Desired-origin change feed. Producers enqueue these into the event
    /// queue; the seq stamp is assigned there.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Create or update one desired record. The write path is the only
    /// mutation point; key shape and parent presence are validated here.
    pub fn put(&self, resource: Resource) -> SyncResult<()> {
        ResourceKey::parse(resource.key.as_str())?;
        match resource.key.kind() {
            Some(k) if k == resource.kind => {}
            _ => {
                return Err(SyncError::Validation(format!(
                    "kind {:?} does not match key {}",
                    resource.kind, resource.key
                )))
            }
        }
        let kind;
        let key = resource.key.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(parent) = key.parent() {
                match inner.records.get(&parent) {
                    Some(p) if !p.deleting => {}
                    _ => {
                        return Err(SyncError::Validation(format!(
                            "parent {parent} absent for {key}"
                        )))
                    }
                }
            }
            let mut r = resource;
            r.version = inner.next_version;
            inner.next_version += 1;
            kind = match inner.records.get(&r.key) {
                Some(prev) if !prev.deleting => EventKind::Updated,
                _ => EventKind::Created,
            };
            self.persist_put(&r, false)?;
            inner.records.insert(r.key.clone(), DesiredRecord::new(r));
            self.swap_snapshot(&mut inner);
        }
        counter!("dss_put_total", 1u64);
        self.emit(key, kind);
        Ok(())
    }

    /// Soft-delete `key` and its whole subtree. Records stay visible (and
    /// keep the fabric-side teardown alive) until `purge` confirms removal.
    pub fn mark_deleting(&self, key: &ResourceKey) -> SyncResult<Vec<ResourceKey>> {
        let mut marked = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let affected: Vec<ResourceKey> = inner
                .records
                .keys()
                .filter(|k| (*k).in_scope(key))
                .cloned()
                .collect();
            if affected.is_empty() {
                return Err(SyncError::Validation(format!("no desired record under {key}")));
            }
            for k in affected {
                if let Some(rec) = inner.records.get_mut(&k) {
                    if !rec.deleting {
                        rec.deleting = true;
                        let res = rec.resource.clone();
                        self.persist_put(&res, true)?;
                        marked.push(k);
                    }
                }
            }
            self.swap_snapshot(&mut inner);
        }
        counter!("dss_delete_total", marked.len() as u64);
        for k in &marked {
            self.emit(k.clone(), EventKind::Deleted);
        }
        Ok(marked)
    }

    /// Hard-delete soft-deleted records under `key` once reconciliation has
    /// confirmed the fabric no longer has them. No event: this is
    /// reconciliation-internal bookkeeping.
    pub fn purge(&self, key: &ResourceKey) -> SyncResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let gone: Vec<ResourceKey> = inner
            .records
            .iter()
            .filter(|(k, r)| r.deleting && (*k).in_scope(key))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &gone {
            inner.records.remove(k);
            self.persist_remove(k)?;
        }
        if !gone.is_empty() {
            self.swap_snapshot(&mut inner);
            debug!(scope = %key, purged = gone.len(), "purged confirmed deletions");
        }
        Ok(gone.len())
    }

    pub fn get(&self, key: &ResourceKey) -> Option<DesiredRecord> {
        self.snap.load().records.get(key).cloned()
    }

    /// Ingest a YAML seed document. Kind is inferred from each key's leaf
    /// prefix; entries are applied parents-first regardless of document
    /// order. Returns how many records were written.
    pub fn load_yaml(&self, doc: &str) -> SyncResult<usize> {
        #[derive(Debug, Deserialize)]
        struct SeedResource {
            key: String,
            #[serde(default)]
            props: BTreeMap<String, String>,
        }
        #[derive(Debug, Deserialize)]
        struct SeedDoc {
            resources: Vec<SeedResource>,
        }
        let doc: SeedDoc = serde_yaml::from_str(doc)
            .map_err(|e| SyncError::Validation(format!("seed parse: {e}")))?;
        let mut entries = Vec::with_capacity(doc.resources.len());
        for sr in doc.resources {
            let key = ResourceKey::parse(&sr.key)?;
            let kind = key
                .kind()
                .ok_or_else(|| SyncError::Validation(format!("no kind for {key}")))?;
            entries.push(Resource { kind, key, props: sr.props, version: 0 });
        }
        entries.sort_by_key(|r| r.key.depth());
        let n = entries.len();
        for r in entries {
            self.put(r)?;
        }
        info!(records = n, "seed document loaded");
        Ok(n)
    }

    fn emit(&self, key: ResourceKey, kind: EventKind) {
        let _ = self.events.send(ChangeEvent { key, origin: Origin::Desired, kind, seq: 0 });
    }

    fn swap_snapshot(&self, inner: &mut Inner) {
        inner.epoch += 1;
        self.snap.store(Arc::new(DesiredSnapshot {
            epoch: inner.epoch,
            records: inner.records.clone(),
        }));
    }

    fn persist_put(&self, r: &Resource, deleting: bool) -> SyncResult<()> {
        if let Some(db) = &self.db {
            let props = serde_json::to_string(&r.props)
                .map_err(|e| SyncError::Internal(e.to_string()))?;
            let kind = serde_json::to_value(r.kind)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            db.lock()
                .unwrap()
                .execute(
                    "INSERT INTO desired(key, kind, props, version, deleting)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(key) DO UPDATE SET
                        kind = ?2, props = ?3, version = ?4, deleting = ?5",
                    (r.key.as_str(), kind, props, r.version as i64, deleting as i64),
                )
                .map_err(|e| SyncError::Internal(format!("persist put: {e}")))?;
        }
        Ok(())
    }

    fn persist_remove(&self, key: &ResourceKey) -> SyncResult<()> {
        if let Some(db) = &self.db {
            db.lock()
                .unwrap()
                .execute("DELETE FROM desired WHERE key = ?1", [key.as_str()])
                .map_err(|e| SyncError::Internal(format!("persist remove: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(key: &str) -> Resource {
        let key = ResourceKey::parse(key).unwrap();
        let kind = key.kind().unwrap();
        Resource::new(kind, key)
    }

    #[test]
    fn put_requires_parent() {
        let s = DesiredStore::in_memory();
        assert!(s.put(res("tn-a/bd-web")).is_err());
        s.put(res("tn-a")).unwrap();
        s.put(res("tn-a/bd-web")).unwrap();
        assert_eq!(s.snapshot().subtree(&ResourceKey::root_for("a")).len(), 2);
    }

    #[test]
    fn versions_are_monotonic() {
        let s = DesiredStore::in_memory();
        s.put(res("tn-a")).unwrap();
        let v1 = s.get(&ResourceKey::root_for("a")).unwrap().resource.version;
        s.put(res("tn-a").with_prop("descr", "x")).unwrap();
        let v2 = s.get(&ResourceKey::root_for("a")).unwrap().resource.version;
        assert!(v2 > v1);
    }

    #[test]
    fn soft_delete_cascades_and_purge_removes() {
        let s = DesiredStore::in_memory();
        s.put(res("tn-a")).unwrap();
        s.put(res("tn-a/bd-web")).unwrap();
        s.put(res("tn-a/bd-web/subnet-10.0.0.0_24")).unwrap();
        let marked = s.mark_deleting(&ResourceKey::parse("tn-a/bd-web").unwrap()).unwrap();
        assert_eq!(marked.len(), 2);
        let snap = s.snapshot();
        assert_eq!(snap.subtree(&ResourceKey::root_for("a")).len(), 1);
        assert_eq!(snap.deleting_keys(&ResourceKey::root_for("a")).len(), 2);
        let purged = s.purge(&ResourceKey::root_for("a")).unwrap();
        assert_eq!(purged, 2);
        assert!(s.get(&ResourceKey::parse("tn-a/bd-web").unwrap()).is_none());
    }

    #[test]
    fn events_emitted_on_mutation() {
        let s = DesiredStore::in_memory();
        let mut rx = s.subscribe();
        s.put(res("tn-a")).unwrap();
        s.put(res("tn-a").with_prop("descr", "x")).unwrap();
        s.mark_deleting(&ResourceKey::root_for("a")).unwrap();
        let e1 = rx.try_recv().unwrap();
        assert_eq!((e1.kind, e1.origin), (EventKind::Created, Origin::Desired));
        let e2 = rx.try_recv().unwrap();
        assert_eq!(e2.kind, EventKind::Updated);
        let e3 = rx.try_recv().unwrap();
        assert_eq!(e3.kind, EventKind::Deleted);
    }

    #[test]
    fn yaml_seed_orders_parents_first() {
        let s = DesiredStore::in_memory();
        let doc = r#"
resources:
  - key: tn-green/bd-web
    props: { vrf: main }
  - key: tn-green
  - key: tn-green/bd-web/subnet-10.0.0.0_24
    props: { gw: 10.0.0.1 }
"#;
        assert_eq!(s.load_yaml(doc).unwrap(), 3);
        let snap = s.snapshot();
        let sub = snap.subtree(&ResourceKey::root_for("green"));
        assert_eq!(sub.len(), 3);
        assert_eq!(sub[0].key.as_str(), "tn-green");
    }

    #[test]
    fn sqlite_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir
            .join(format!(
                "fabrica-test-{}.db",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ))
            .to_string_lossy()
            .to_string();
        {
            let s = DesiredStore::open(&path).unwrap();
            s.put(res("tn-a")).unwrap();
            s.put(res("tn-a/bd-web").with_prop("vrf", "main")).unwrap();
            s.mark_deleting(&ResourceKey::parse("tn-a/bd-web").unwrap()).unwrap();
        }
        let s = DesiredStore::open(&path).unwrap();
        let rec = s.get(&ResourceKey::parse("tn-a/bd-web").unwrap()).unwrap();
        assert!(rec.deleting);
        assert_eq!(rec.resource.props.get("vrf").map(|s| s.as_str()), Some("main"));
        // versions continue past what was stored
        s.put(res("tn-b")).unwrap();
        assert!(s.get(&ResourceKey::root_for("b")).unwrap().resource.version > rec.resource.version);
    }
}
