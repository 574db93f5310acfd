//! # Reference index
//!
//! In-memory bookkeeping of which ConfigMapSecrets reference which Secrets
//! and ConfigMaps, and which source UID owns which rendered secret. The
//! index answers the event dispatcher's reverse lookups ("which sources must
//! be re-reconciled when this dependency changes?") in O(1) per row.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Key = (String, String); // (namespace, name)

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// A bidirectional relation between namespaced source names and destination
/// names. Both directions are maintained on every mutation; empty rows are
/// removed eagerly so the maps stay proportional to the live graph.
#[derive(Debug, Default)]
pub struct RefMap {
    src_dsts: HashMap<Key, HashSet<String>>,
    dst_srcs: HashMap<Key, HashSet<String>>,
}

impl RefMap {
    /// Replaces the outgoing edges of `src` with `dsts`, removing edges that
    /// are no longer present and inserting fresh ones.
    pub fn set(&mut self, namespace: &str, src: &str, dsts: &HashSet<String>) {
        let current: Vec<String> = self.dsts(namespace, src).cloned().collect();
        for dst in current {
            if !dsts.contains(&dst) {
                self.rem(namespace, src, &dst);
            }
        }
        for dst in dsts {
            if !self.has(namespace, src, dst) {
                self.add(namespace, src, dst);
            }
        }
    }

    fn add(&mut self, namespace: &str, src: &str, dst: &str) {
        self.src_dsts
            .entry(key(namespace, src))
            .or_default()
            .insert(dst.to_string());
        self.dst_srcs
            .entry(key(namespace, dst))
            .or_default()
            .insert(src.to_string());
    }

    fn rem(&mut self, namespace: &str, src: &str, dst: &str) {
        let src_key = key(namespace, src);
        if let Some(dsts) = self.src_dsts.get_mut(&src_key) {
            dsts.remove(dst);
            if dsts.is_empty() {
                self.src_dsts.remove(&src_key);
            }
        }
        let dst_key = key(namespace, dst);
        if let Some(srcs) = self.dst_srcs.get_mut(&dst_key) {
            srcs.remove(src);
            if srcs.is_empty() {
                self.dst_srcs.remove(&dst_key);
            }
        }
    }

    /// Destinations referenced by `src`.
    pub fn dsts(&self, namespace: &str, src: &str) -> impl Iterator<Item = &String> {
        self.src_dsts.get(&key(namespace, src)).into_iter().flatten()
    }

    /// Sources referencing `dst`.
    pub fn srcs(&self, namespace: &str, dst: &str) -> impl Iterator<Item = &String> {
        self.dst_srcs.get(&key(namespace, dst)).into_iter().flatten()
    }

    fn has(&self, namespace: &str, src: &str, dst: &str) -> bool {
        self.src_dsts
            .get(&key(namespace, src))
            .is_some_and(|dsts| dsts.contains(dst))
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        (self.src_dsts.len(), self.dst_srcs.len())
    }
}

/// Process-wide reference state shared between the reconciler and the event
/// dispatcher, guarded by a single `RwLock` at the call sites.
#[derive(Debug, Default)]
pub struct RefIndex {
    secrets: RefMap,
    config_maps: RefMap,
    owned: RefMap,
}

impl RefIndex {
    /// Records the dependency names referenced by the source's spec.
    pub fn set_refs(
        &mut self,
        namespace: &str,
        source: &str,
        secrets: &HashSet<String>,
        config_maps: &HashSet<String>,
    ) {
        self.secrets.set(namespace, source, secrets);
        self.config_maps.set(namespace, source, config_maps);
    }

    /// Clears the dependency rows of a deleted source.
    pub fn clear_refs(&mut self, namespace: &str, source: &str) {
        let empty = HashSet::new();
        self.set_refs(namespace, source, &empty, &empty);
    }

    /// Sources that reference the named Secret as a data source.
    pub fn secret_srcs(&self, namespace: &str, secret: &str) -> Vec<String> {
        self.secrets.srcs(namespace, secret).cloned().collect()
    }

    /// Sources that reference the named ConfigMap.
    pub fn config_map_srcs(&self, namespace: &str, config_map: &str) -> Vec<String> {
        self.config_maps.srcs(namespace, config_map).cloned().collect()
    }

    /// Records or clears the controller owner of a rendered secret.
    pub fn set_owner(&mut self, namespace: &str, secret: &str, uid: Option<&str>) {
        let uids: HashSet<String> = uid.map(str::to_string).into_iter().collect();
        self.owned.set(namespace, secret, &uids);
    }

    /// Names of the secrets currently owned by the source with `uid`.
    pub fn owned_secrets(&self, namespace: &str, uid: &str) -> Vec<String> {
        self.owned.srcs(namespace, uid).cloned().collect()
    }
}

/// Read side of the shared index lock. A poisoned lock is recovered; the
/// index holds no invariants that span a panic.
pub fn read(lock: &RwLock<RefIndex>) -> RwLockReadGuard<'_, RefIndex> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write side of the shared index lock.
pub fn write(lock: &RwLock<RefIndex>) -> RwLockWriteGuard<'_, RefIndex> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
