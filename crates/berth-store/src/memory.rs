//! In-memory store with revision history
//!
//! Backs tests and the local development mode. Mirrors the gateway
//! semantics of the etcd client: per-key history survives overwrites, a
//! delete removes the live value and its history.

use crate::kv::{KvStore, Namespace, WatchEvent, WatchEventKind};
use async_trait::async_trait;
use berth_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    /// Full key -> historical values, oldest first; last entry is live
    entries: HashMap<String, Vec<Vec<u8>>>,
    /// Namespace -> watch subscribers
    watchers: HashMap<&'static str, Vec<mpsc::UnboundedSender<WatchEvent>>>,
}

/// An in-memory [`KvStore`] implementation
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(inner: &mut Inner, ns: Namespace, event: WatchEvent) {
        if let Some(subscribers) = inner.watchers.get_mut(ns.as_str()) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<()> {
        let full = ns.prefixed(key);
        let mut inner = self.inner.lock();
        inner.entries.entry(full.clone()).or_default().push(value.clone());
        Self::notify(
            &mut inner,
            ns,
            WatchEvent {
                kind: WatchEventKind::Put,
                key: full,
                value,
            },
        );
        Ok(())
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Vec<u8>> {
        let full = ns.prefixed(key);
        let inner = self.inner.lock();
        inner
            .entries
            .get(&full)
            .and_then(|history| history.last())
            .cloned()
            .ok_or(Error::NotExistInStore(full))
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let full = ns.prefixed(key);
        let mut inner = self.inner.lock();
        inner.entries.remove(&full);
        Self::notify(
            &mut inner,
            ns,
            WatchEvent {
                kind: WatchEventKind::Delete,
                key: full,
                value: Vec::new(),
            },
        );
        Ok(())
    }

    async fn revision(&self, ns: Namespace, key: &str, n: i64) -> Result<Vec<u8>> {
        let full = ns.prefixed(key);
        let inner = self.inner.lock();
        let history = inner
            .entries
            .get(&full)
            .ok_or_else(|| Error::NotExistInStore(full.clone()))?;
        if n < 1 || n as usize > history.len() {
            return Err(Error::store(format!(
                "revision {} out of range for key {} ({} revisions)",
                n,
                full,
                history.len()
            )));
        }
        Ok(history[(n - 1) as usize].clone())
    }

    async fn range(&self, ns: Namespace, key: &str) -> Result<Vec<(i64, Vec<u8>)>> {
        let full = ns.prefixed(key);
        let inner = self.inner.lock();
        let history = inner
            .entries
            .get(&full)
            .ok_or(Error::NotExistInStore(full))?;
        Ok(history
            .iter()
            .enumerate()
            .map(|(i, value)| ((i + 1) as i64, value.clone()))
            .collect())
    }

    async fn list(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = format!("{}/", ns.as_str());
        let inner = self.inner.lock();
        let mut live: Vec<(String, Vec<u8>)> = inner
            .entries
            .iter()
            .filter(|(key, history)| key.starts_with(&prefix) && !history.is_empty())
            .map(|(key, history)| {
                (
                    key[prefix.len()..].to_string(),
                    history.last().cloned().unwrap_or_default(),
                )
            })
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }

    async fn watch(&self, ns: Namespace) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .watchers
            .entry(ns.as_str())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_miss_is_not_exist() {
        let store = MemoryStore::new();
        let err = store.get(Namespace::Containers, "job").await.unwrap_err();
        assert!(matches!(err, Error::NotExistInStore(_)));
    }

    #[tokio::test]
    async fn test_revision_history() {
        let store = MemoryStore::new();
        store
            .put(Namespace::Containers, "job", b"v1".to_vec())
            .await
            .unwrap();
        store
            .put(Namespace::Containers, "job", b"v2".to_vec())
            .await
            .unwrap();

        assert_eq!(store.get(Namespace::Containers, "job").await.unwrap(), b"v2");
        assert_eq!(
            store.revision(Namespace::Containers, "job", 1).await.unwrap(),
            b"v1"
        );
        let history = store.range(Namespace::Containers, "job").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], (1, b"v1".to_vec()));
        assert_eq!(history[1], (2, b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_removes_live_and_history() {
        let store = MemoryStore::new();
        store
            .put(Namespace::Containers, "job", b"v1".to_vec())
            .await
            .unwrap();
        store.delete(Namespace::Containers, "job").await.unwrap();
        assert!(store.get(Namespace::Containers, "job").await.is_err());
        assert!(store.range(Namespace::Containers, "job").await.is_err());
    }

    #[tokio::test]
    async fn test_list_namespace() {
        let store = MemoryStore::new();
        store
            .put(Namespace::Containers, "a", b"1".to_vec())
            .await
            .unwrap();
        store
            .put(Namespace::Containers, "b", b"2".to_vec())
            .await
            .unwrap();
        store.put(Namespace::Gpus, "status", b"x".to_vec()).await.unwrap();

        let live = store.list(Namespace::Containers).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].0, "a");
        assert_eq!(live[1].0, "b");
    }

    #[tokio::test]
    async fn test_watch_sees_puts_and_deletes() {
        let store = MemoryStore::new();
        let mut rx = store.watch(Namespace::Containers).await.unwrap();

        store
            .put(Namespace::Containers, "job", b"v1".to_vec())
            .await
            .unwrap();
        store.delete(Namespace::Containers, "job").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, WatchEventKind::Put);
        assert_eq!(first.key, "containers/job");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, WatchEventKind::Delete);
    }
}
