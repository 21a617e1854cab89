//! Host-port scheduler
//!
//! Tracks a configured range of allocatable host ports. One host port is
//! reserved per exposed container port on the run path and released when
//! the owning container version is removed.

use crate::RestorePool;
use berth_core::{Error, Result};
use berth_store::{KvStore, Namespace, WriteBehind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::info;

pub(crate) const STATUS_KEY: &str = "status";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortPool {
    capacity: usize,
    /// host port (decimal string) -> in-use flag
    status: BTreeMap<String, bool>,
}

/// Scheduler for the host's allocatable port range
pub struct PortScheduler {
    pool: RwLock<PortPool>,
    queue: WriteBehind,
}

impl PortScheduler {
    /// Rehydrate from the store snapshot or seed from the configured range
    pub async fn init(
        store: &dyn KvStore,
        queue: WriteBehind,
        range: Range<u16>,
    ) -> Result<Arc<Self>> {
        let mut pool: PortPool = match store.get(Namespace::Ports, STATUS_KEY).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(Error::NotExistInStore(_)) => PortPool::default(),
            Err(e) => return Err(e),
        };

        if pool.capacity == 0 || pool.status.is_empty() {
            pool.status = range.clone().map(|p| (p.to_string(), false)).collect();
            pool.capacity = pool.status.len();
            store
                .put(Namespace::Ports, STATUS_KEY, serde_json::to_vec(&pool)?)
                .await?;
            info!(
                ports = pool.capacity,
                start = range.start,
                "port scheduler initialized from configured range"
            );
        } else {
            info!(ports = pool.capacity, "port scheduler rehydrated from store");
        }

        Ok(Arc::new(Self {
            pool: RwLock::new(pool),
            queue,
        }))
    }

    /// Atomically reserve `n` free host ports
    pub fn apply(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Err(Error::invalid_request("port count must be greater than 0"));
        }

        let mut pool = self.pool.write();
        if n > pool.capacity {
            let free = pool.status.values().filter(|used| !**used).count();
            return Err(Error::PortNotEnough { requested: n, free });
        }

        let mut reserved = Vec::with_capacity(n);
        for (port, used) in pool.status.iter_mut() {
            if !*used {
                *used = true;
                reserved.push(port.clone());
                if reserved.len() == n {
                    break;
                }
            }
        }

        if reserved.len() < n {
            for port in &reserved {
                pool.status.insert(port.clone(), false);
            }
            let free = pool.status.values().filter(|used| !**used).count();
            return Err(Error::PortNotEnough { requested: n, free });
        }

        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Ports, STATUS_KEY, snapshot);
        Ok(reserved)
    }

    /// Mark host ports free again; idempotent
    pub fn restore(&self, ports: &[String]) {
        if ports.is_empty() {
            return;
        }
        let mut pool = self.pool.write();
        for port in ports {
            if let Some(used) = pool.status.get_mut(port) {
                *used = false;
            }
        }
        let snapshot = snapshot_bytes(&pool);
        drop(pool);
        self.queue.put(Namespace::Ports, STATUS_KEY, snapshot);
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

impl RestorePool for PortScheduler {
    fn restore_ids(&self, ids: &[String]) {
        self.restore(ids);
    }
}

fn snapshot_bytes(pool: &PortPool) -> Vec<u8> {
    serde_json::to_vec(pool).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_store::MemoryStore;

    async fn fresh() -> Arc<PortScheduler> {
        let store = Arc::new(MemoryStore::new());
        let (queue, _worker) = WriteBehind::spawn(store.clone());
        PortScheduler::init(store.as_ref(), queue, 40000..40010)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pool_membership_from_range() {
        let scheduler = fresh().await;
        let status = scheduler.status();
        assert_eq!(status.len(), 10);
        assert!(status.contains_key("40000"));
        assert!(status.contains_key("40009"));
        assert!(!status.contains_key("40010"));
    }

    #[tokio::test]
    async fn test_apply_restore_cycle() {
        let scheduler = fresh().await;
        let reserved = scheduler.apply(3).unwrap();
        assert_eq!(reserved.len(), 3);
        assert_eq!(scheduler.in_use(), 3);

        scheduler.restore(&reserved);
        assert_eq!(scheduler.in_use(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let scheduler = fresh().await;
        scheduler.apply(10).unwrap();
        let err = scheduler.apply(1).unwrap_err();
        assert!(matches!(
            err,
            Error::PortNotEnough {
                requested: 1,
                free: 0
            }
        ));
    }
}
