//! Fabrica differ: computes the ordered operation list that converges
//! observed fabric state onto desired state for one scope.
//!
//! Emission order is deletes (child before parent), then creates (parent
//! before child), then updates. A key present on both sides with a kind
//! mismatch becomes delete + create, never update. Unrelated keys are
//! sorted lexicographically so the output is deterministic.

#![forbid(unsafe_code)]

use std::cmp::Reverse;

use fabrica_core::{Operation, OpVerb, Resource, ResourceKey};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// `desired` must already exclude soft-deleted records: a key that is
/// observed but not desired is torn down regardless of why it is absent.
pub fn diff(desired: &[Resource], observed: &[Resource]) -> Vec<Operation> {
    let want: FxHashMap<&ResourceKey, &Resource> =
        desired.iter().map(|r| (&r.key, r)).collect();
    let have: FxHashMap<&ResourceKey, &Resource> =
        observed.iter().map(|r| (&r.key, r)).collect();

    let mut creates: Vec<&Resource> = Vec::new();
    let mut updates: Vec<&Resource> = Vec::new();
    let mut deletes: Vec<&ResourceKey> = Vec::new();

    for r in desired {
        match have.get(&r.key) {
            None => creates.push(r),
            Some(live) if live.kind != r.kind => {
                // Type change: tear down, then recreate.
                deletes.push(&r.key);
                creates.push(r);
            }
            Some(live) if !live.same_config(r) => updates.push(r),
            Some(_) => {}
        }
    }
    for r in observed {
        if !want.contains_key(&r.key) {
            deletes.push(&r.key);
        }
    }

    // Parent-before-child for creates, child-before-parent for deletes.
    creates.sort_by_key(|r| (r.key.depth(), r.key.clone()));
    deletes.sort_by_key(|k| (Reverse(k.depth()), (*k).clone()));
    updates.sort_by_key(|r| r.key.clone());

    let creating: FxHashSet<&ResourceKey> = creates.iter().map(|r| &r.key).collect();
    let deleting: FxHashSet<&ResourceKey> = deletes.iter().copied().collect();

    let mut out = Vec::with_capacity(creates.len() + updates.len() + deletes.len());
    for key in &deletes {
        // A delete waits for deletes of its children in the same batch.
        let deps: Vec<ResourceKey> = deleting
            .iter()
            .filter(|k| key.is_ancestor_of(k))
            .map(|k| (*k).clone())
            .collect();
        out.push(Operation { key: (*key).clone(), verb: OpVerb::Delete, payload: None, deps });
    }
    for r in &creates {
        // A create waits for its parent's create when batched together.
        let deps = match r.key.parent() {
            Some(p) if creating.contains(&p) => vec![p],
            _ => Vec::new(),
        };
        out.push(Operation {
            key: r.key.clone(),
            verb: OpVerb::Create,
            payload: Some((*r).clone()),
            deps,
        });
    }
    for r in &updates {
        out.push(Operation {
            key: r.key.clone(),
            verb: OpVerb::Update,
            payload: Some((*r).clone()),
            deps: Vec::new(),
        });
    }
    if !out.is_empty() {
        debug!(
            creates = creates.len(),
            updates = updates.len(),
            deletes = deletes.len(),
            "diff computed"
        );
    }
    out
}
