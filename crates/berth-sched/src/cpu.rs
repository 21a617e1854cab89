//! CPU scheduler
//!
//! Tracks logical CPU ids. Allocations come back in ascending numeric
//! order: cpuset strings are compared textually downstream, so the order
//! must be stable across calls that reserve the same set.

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
struct CpuPool {
    capacity: usize,
    /// logical cpu id (decimal string) -> in-use flag
    status: BTreeMap<String, bool>,
}

/// Scheduler for the host's logical CPUs
pub struct CpuScheduler {
    pool: RwLock<CpuPool>,
    queue: WriteBehind,
}

impl CpuScheduler {
    /// Rehydrate from the store snapshot or seed from the processor count
    pub async fn init(
        store: &dyn KvStore,
        queue: WriteBehind,
        cpu_count: usize,
    ) -> Result<Arc<Self>> {
        let mut pool: CpuPool = match store.get(Namespace::Cpus, STATUS_KEY).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(Error::NotExistInStore(_)) => CpuPool::default(),
            Err(e) => return Err(e),
        };

        if pool.capacity == 0 || pool.status.is_empty() {
            pool.capacity = cpu_count;
            pool.status = (0..cpu_count).map(|i| (i.to_string(), false)).collect();
            store
                .put(Namespace::Cpus, STATUS_KEY, serde_json::to_vec(&pool)?)
                .await?;
            info!(cpus = pool.capacity, "cpu scheduler initialized from host");
        } else {
            info!(cpus = pool.capacity, "cpu scheduler rehydrated from store");
        }

        Ok(Arc::new(Self {
            pool: RwLock::new(pool),
            queue,
        }))
    }

    /// Atomically reserve `n` free CPUs, lowest ids first
    pub fn apply(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Err(Error::invalid_request("cpu count must be greater than 0"));
        }

        let mut pool = self.pool.write();
        if n > pool.capacity {
            let free = pool.status.values().filter(|used| !**used).count();
            return Err(Error::CpuNotEnough { requested: n, free });
        }

        let mut ids: Vec<usize> = pool
            .status
            .keys()
            .filter_map(|k| k.parse::<usize>().ok())
            .collect();
        ids.sort_unstable();

        let mut reserved = Vec::with_capacity(n);
        for id in ids {
            let key = id.to_string();
            if let Some(used) = pool.status.get_mut(&key) {
                if !*used {
                    *used = true;
                    reserved.push(key);
                    if reserved.len() == n {
                        break;
                    }
                }
            }
        }

        if reserved.len() < n {
            for key in &reserved {
                pool.status.insert(key.clone(), false);
            }
            let free = pool.status.values().filter(|used| !**used).count();
            return Err(Error::CpuNotEnough { requested: n, free });
        }

        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Cpus, STATUS_KEY, snapshot);
        Ok(reserved)
    }

    /// Mark CPUs free again; idempotent
    pub fn restore(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut pool = self.pool.write();
        for id in ids {
            if let Some(used) = pool.status.get_mut(id) {
                *used = false;
            }
        }
        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Cpus, STATUS_KEY, snapshot);
    }

    /// Copy-on-read snapshot of the free/in-use map
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.pool.read().status.clone()
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

impl RestorePool for CpuScheduler {
    fn restore_ids(&self, ids: &[String]) {
        self.restore(ids);
    }
}

fn snapshot_bytes(pool: &CpuPool) -> Vec<u8> {
    serde_json::to_vec(pool).unwrap_or_default()
}
