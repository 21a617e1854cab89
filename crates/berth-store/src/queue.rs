//! The write-behind queue
//!
//! A single unbounded FIFO between every mutating component and the store.
//! Producers (schedulers on each pool mutation, the controller on each
//! lifecycle transition) enqueue without blocking; one consumer task applies
//! the items in order. A failed write is logged and dropped: the in-memory
//! state already transitioned, so the store may lag reality across restarts.

use crate::kv::{KvStore, Namespace};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A pending store write
#[derive(Debug, Clone)]
pub enum StoreTask {
    Put {
        ns: Namespace,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        ns: Namespace,
        key: String,
    },
}

/// Producer handle to the write-behind queue
#[derive(Clone)]
pub struct WriteBehind {
    tx: mpsc::UnboundedSender<StoreTask>,
}

impl WriteBehind {
    /// Spawn the consumer task against `store` and return the producer
    /// handle plus the consumer's join handle (awaited on shutdown for a
    /// best-effort drain).
    pub fn spawn(store: Arc<dyn KvStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreTask>();

        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let outcome = match &task {
                    StoreTask::Put { ns, key, value } => {
                        store.put(*ns, key, value.clone()).await
                    }
                    StoreTask::Delete { ns, key } => store.delete(*ns, key).await,
                };
                match outcome {
                    Ok(()) => debug!(task = ?task_label(&task), "write-behind applied"),
                    Err(e) => {
                        error!(task = ?task_label(&task), error = %e, "write-behind dropped")
                    }
                }
            }
            info!("write-behind queue drained");
        });

        (Self { tx }, worker)
    }

    /// Enqueue a put of `value` at `<ns>/<key>`
    pub fn put(&self, ns: Namespace, key: impl Into<String>, value: Vec<u8>) {
        self.send(StoreTask::Put {
            ns,
            key: key.into(),
            value,
        });
    }

    /// Enqueue a delete of `<ns>/<key>`
    pub fn delete(&self, ns: Namespace, key: impl Into<String>) {
        self.send(StoreTask::Delete { ns, key: key.into() });
    }

    fn send(&self, task: StoreTask) {
        if self.tx.send(task).is_err() {
            error!("write-behind queue is closed; store write lost");
        }
    }
}

fn task_label(task: &StoreTask) -> String {
    match task {
        StoreTask::Put { ns, key, .. } => format!("put {}/{}", ns, key),
        StoreTask::Delete { ns, key } => format!("delete {}/{}", ns, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::WatchEvent;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use berth_core::{Error, Result};

    #[tokio::test]
    async fn test_fifo_ordering_within_key() {
        let store = Arc::new(MemoryStore::new());
        let (queue, worker) = WriteBehind::spawn(store.clone());

        for i in 0..10 {
            queue.put(
                Namespace::Containers,
                "job",
                format!("v{}", i).into_bytes(),
            );
        }
        drop(queue);
        worker.await.unwrap();

        let history = store.range(Namespace::Containers, "job").await.unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].1, b"v0");
        assert_eq!(history[9].1, b"v9");
        assert_eq!(store.get(Namespace::Containers, "job").await.unwrap(), b"v9");
    }

    #[tokio::test]
    async fn test_delete_applies_after_puts() {
        let store = Arc::new(MemoryStore::new());
        let (queue, worker) = WriteBehind::spawn(store.clone());

        queue.put(Namespace::Containers, "job", b"v1".to_vec());
        queue.delete(Namespace::Containers, "job");
        drop(queue);
        worker.await.unwrap();

        assert!(store.get(Namespace::Containers, "job").await.is_err());
    }

    struct FailingStore;

    #[async_trait]
    impl KvStore for FailingStore {
        async fn put(&self, _ns: Namespace, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(Error::store("down"))
        }
        async fn get(&self, ns: Namespace, key: &str) -> Result<Vec<u8>> {
            Err(Error::NotExistInStore(ns.prefixed(key)))
        }
        async fn delete(&self, _ns: Namespace, _key: &str) -> Result<()> {
            Err(Error::store("down"))
        }
        async fn revision(&self, _ns: Namespace, _key: &str, _n: i64) -> Result<Vec<u8>> {
            Err(Error::store("down"))
        }
        async fn range(&self, _ns: Namespace, _key: &str) -> Result<Vec<(i64, Vec<u8>)>> {
            Err(Error::store("down"))
        }
        async fn list(&self, _ns: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
            Err(Error::store("down"))
        }
        async fn watch(
            &self,
            _ns: Namespace,
        ) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
            Err(Error::store("down"))
        }
    }

    #[tokio::test]
    async fn test_consumer_survives_store_errors() {
        let (queue, worker) = WriteBehind::spawn(Arc::new(FailingStore));

        queue.put(Namespace::Gpus, "status", b"snapshot".to_vec());
        queue.put(Namespace::Cpus, "status", b"snapshot".to_vec());
        drop(queue);

        // the worker must drain and exit cleanly even though every write failed
        worker.await.unwrap();
    }
}
