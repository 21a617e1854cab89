//! # berth-store
//!
//! Key-value persistence for berth.
//!
//! This crate provides:
//! - The [`KvStore`] trait: typed, namespaced put/get/delete with per-key
//!   revision history and watch
//! - [`EtcdStore`]: a client for the etcd v3 JSON gateway
//! - [`MemoryStore`]: an in-memory store with revision history for tests
//!   and local development
//! - [`WriteBehind`]: the asynchronous single-consumer write queue that
//!   decouples caller latency from store durability

pub mod etcd;
pub mod kv;
pub mod memory;
pub mod queue;

pub use etcd::EtcdStore;
pub use kv::{KvStore, Namespace, WatchEvent, WatchEventKind};
pub use memory::MemoryStore;
pub use queue::{StoreTask, WriteBehind};
