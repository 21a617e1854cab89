//! The key-value gateway trait
//!
//! All berth persistence goes through [`KvStore`]. Keys are namespaced
//! (`containers/<name>`, `gpus/status`, ...) and every write to a key stays
//! addressable by a 1-based per-key revision number, which the controller
//! uses for point-in-time rollback.

use async_trait::async_trait;
use berth_core::Result;
use tokio::sync::mpsc;

/// The fixed namespaces of the berth store layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Containers,
    Volumes,
    Gpus,
    Cpus,
    Ports,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Containers => "containers",
            Namespace::Volumes => "volumes",
            Namespace::Gpus => "gpus",
            Namespace::Cpus => "cpus",
            Namespace::Ports => "ports",
        }
    }

    /// The full store key for `key` within this namespace
    pub fn prefixed(&self, key: &str) -> String {
        format!("{}/{}", self.as_str(), key)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A change observed on a namespace
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub value: Vec<u8>,
}

/// Typed, namespaced access to the remote key-value store.
///
/// Implementations must be safe for concurrent callers; the write-behind
/// queue is the only serialized writer for scheduler snapshots, but read
/// paths are hit from every request thread.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write the live value for a key
    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read the live value for a key; missing keys are `NotExistInStore`
    async fn get(&self, ns: Namespace, key: &str) -> Result<Vec<u8>>;

    /// Remove the live value for a key
    async fn delete(&self, ns: Namespace, key: &str) -> Result<()>;

    /// Read the n-th historical write of a key (1-based)
    async fn revision(&self, ns: Namespace, key: &str, n: i64) -> Result<Vec<u8>>;

    /// All historical writes of a key as `(revision, value)` pairs,
    /// oldest first
    async fn range(&self, ns: Namespace, key: &str) -> Result<Vec<(i64, Vec<u8>)>>;

    /// All live `(key, value)` pairs under a namespace
    async fn list(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>>;

    /// Subscribe to changes under a namespace
    async fn watch(&self, ns: Namespace) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_strings() {
        assert_eq!(Namespace::Containers.as_str(), "containers");
        assert_eq!(Namespace::Gpus.prefixed("status"), "gpus/status");
        assert_eq!(Namespace::Ports.to_string(), "ports");
    }
}
