//! GPU scheduler
//!
//! Tracks every GPU uuid on the host with a free/in-use flag, plus a
//! diagnostic index of which replica set holds which uuids.

use crate::discovery::GpuDiscovery;
use crate::RestorePool;
use berth_core::{Error, Result};
use berth_store::{KvStore, Namespace, WriteBehind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub(crate) const STATUS_KEY: &str = "status";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuPool {
    /// Total number of slots; fixed after initialization
    capacity: usize,
    /// uuid -> in-use flag
    status: BTreeMap<String, bool>,
    /// replica-set name -> held uuids
    alloc: BTreeMap<String, Vec<String>>,
}

/// Scheduler for the host's GPU inventory
pub struct GpuScheduler {
    pool: RwLock<GpuPool>,
    queue: WriteBehind,
}

impl GpuScheduler {
    /// Rehydrate from the store snapshot, falling back to discovery when the
    /// snapshot is absent or empty. The initial snapshot is written
    /// synchronously so a crash right after boot still finds the pool.
    pub async fn init(
        store: &dyn KvStore,
        queue: WriteBehind,
        discovery: &dyn GpuDiscovery,
    ) -> Result<Arc<Self>> {
        let mut pool: GpuPool = match store.get(Namespace::Gpus, STATUS_KEY).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(Error::NotExistInStore(_)) => GpuPool::default(),
            Err(e) => return Err(e),
        };

        if pool.capacity == 0 || pool.status.is_empty() {
            let devices = discovery.discover()?;
            pool.capacity = devices.len();
            pool.status = devices.into_iter().map(|d| (d.uuid, false)).collect();
            pool.alloc.clear();
            store
                .put(Namespace::Gpus, STATUS_KEY, serde_json::to_vec(&pool)?)
                .await?;
            info!(gpus = pool.capacity, "gpu scheduler initialized from discovery");
        } else {
            info!(gpus = pool.capacity, "gpu scheduler rehydrated from store");
        }

        Ok(Arc::new(Self {
            pool: RwLock::new(pool),
            queue,
        }))
    }

    /// Atomically reserve `n` free GPU uuids
    pub fn apply(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Err(Error::invalid_request("gpu count must be greater than 0"));
        }

        let mut pool = self.pool.write();
        if n > pool.capacity {
            let free = pool.status.values().filter(|used| !**used).count();
            return Err(Error::GpuNotEnough { requested: n, free });
        }

        let mut reserved = Vec::with_capacity(n);
        for (uuid, used) in pool.status.iter_mut() {
            if !*used {
                *used = true;
                reserved.push(uuid.clone());
                if reserved.len() == n {
                    break;
                }
            }
        }

        if reserved.len() < n {
            // roll the partial reservation back before reporting failure
            for uuid in &reserved {
                pool.status.insert(uuid.clone(), false);
            }
            let free = pool.status.values().filter(|used| !**used).count();
            return Err(Error::GpuNotEnough { requested: n, free });
        }

        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Gpus, STATUS_KEY, snapshot);
        Ok(reserved)
    }

    /// Mark uuids free again; unknown uuids and already-free uuids are no-ops
    pub fn restore(&self, uuids: &[String]) {
        if uuids.is_empty() {
            return;
        }
        let mut pool = self.pool.write();
        for uuid in uuids {
            if let Some(used) = pool.status.get_mut(uuid) {
                *used = false;
            }
        }
        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Gpus, STATUS_KEY, snapshot);
    }

    /// Copy-on-read snapshot of the free/in-use map
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.pool.read().status.clone()
    }

    /// Record which uuids a replica set currently holds
    pub fn alloc(&self, name: &str, uuids: Vec<String>) {
        let mut pool = self.pool.write();
        pool.alloc.insert(name.to_string(), uuids);
        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Gpus, STATUS_KEY, snapshot);
    }

    /// Drop a replica set from the diagnostic index
    pub fn dealloc(&self, name: &str) {
        let mut pool = self.pool.write();
        pool.alloc.remove(name);
        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Gpus, STATUS_KEY, snapshot);
    }

    /// The diagnostic index of replica-set name -> held uuids
    pub fn alloc_map(&self) -> BTreeMap<String, Vec<String>> {
        self.pool.read().alloc.clone()
    }

    /// Serialized pool state, for the final synchronous write at shutdown
    pub fn snapshot(&self) -> Vec<u8> {
        snapshot_bytes(&self.pool.read())
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.pool.read().status.values().filter(|used| **used).count()
    }
}

impl RestorePool for GpuScheduler {
    fn restore_ids(&self, ids: &[String]) {
        self.restore(ids);
    }
}

fn snapshot_bytes(pool: &GpuPool) -> Vec<u8> {
    serde_json::to_vec(pool).unwrap_or_default()
}
