//! Copy-on-write shared snapshot
//!
//! The coordinator publishes its decoded view through this handle; the
//! Dynamic Export task and API callers read the same snapshot without
//! ever observing a half-applied update. Writers clone the current map,
//! mutate the clone, then swap the Arc in one step.

use crate::registers::FieldMap;
use std::sync::{Arc, RwLock};

/// Cheap-to-clone handle to the latest published snapshot
#[derive(Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Arc<FieldMap>>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; the returned Arc stays consistent even while new
    /// snapshots are published.
    pub fn get(&self) -> Arc<FieldMap> {
        self.read_guard().clone()
    }

    /// Convenience single-key lookup
    pub fn value(&self, key: &str) -> Option<f64> {
        self.read_guard().get(key).copied()
    }

    /// Replace the snapshot wholesale
    pub fn publish(&self, data: FieldMap) {
        *self.write_guard() = Arc::new(data);
    }

    /// Merge new fields into a fresh copy of the snapshot and publish it.
    /// Existing keys not present in `updates` are retained (sticky cache).
    pub fn merge(&self, updates: FieldMap) {
        let mut guard = self.write_guard();
        let mut next = (**guard).clone();
        next.extend(updates);
        *guard = Arc::new(next);
    }

    /// Apply a small patch atomically. `None` removes the key.
    pub fn apply_patch(&self, patch: &[(&str, Option<f64>)]) {
        let mut guard = self.write_guard();
        let mut next = (**guard).clone();
        for (key, value) in patch {
            match value {
                Some(v) => {
                    next.insert((*key).to_string(), *v);
                }
                None => {
                    next.remove(*key);
                }
            }
        }
        *guard = Arc::new(next);
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Arc<FieldMap>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Arc<FieldMap>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}
