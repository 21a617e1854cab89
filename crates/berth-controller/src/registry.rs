//! Version registry and merge map
//!
//! The registry is the in-process source of truth for "which version of
//! this replica set is live". It is not persisted itself; at boot it is
//! reconstructed from the store's live records.

use berth_core::ContainerRecord;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Per-name monotonic version counter
#[derive(Default)]
pub struct VersionRegistry {
    inner: Mutex<HashMap<String, i64>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.inner.lock().get(name).copied()
    }

    pub fn set(&self, name: &str, version: i64) {
        self.inner.lock().insert(name.to_string(), version);
    }

    pub fn remove(&self, name: &str) {
        self.inner.lock().remove(name);
    }

    /// Seed the registry from live container records at boot
    pub fn reconstruct<'a>(&self, records: impl IntoIterator<Item = &'a ContainerRecord>) -> usize {
        let mut inner = self.inner.lock();
        let mut seeded = 0;
        for record in records {
            inner.insert(record.replica_set_name.clone(), record.version);
            seeded += 1;
        }
        seeded
    }
}

/// Preserved overlay upper directories, keyed by replica-set name and version
#[derive(Default)]
pub struct MergeMap {
    inner: Mutex<HashMap<String, BTreeMap<i64, PathBuf>>>,
}

impl MergeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, version: i64, path: PathBuf) {
        self.inner
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(version, path);
    }

    pub fn get(&self, name: &str, version: i64) -> Option<PathBuf> {
        self.inner
            .lock()
            .get(name)
            .and_then(|versions| versions.get(&version).cloned())
    }

    pub fn remove(&self, name: &str, version: i64) {
        let mut inner = self.inner.lock();
        if let Some(versions) = inner.get_mut(name) {
            versions.remove(&version);
            if versions.is_empty() {
                inner.remove(name);
            }
        }
    }

    /// Drop every preserved version of a replica set
    pub fn remove_name(&self, name: &str) {
        self.inner.lock().remove(name);
    }
}
