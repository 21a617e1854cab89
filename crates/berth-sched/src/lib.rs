//! # berth-sched
//!
//! Concurrent resource pools for the host's GPUs, logical CPUs, and
//! allocatable ports.
//!
//! Each scheduler owns a fixed-membership pool of resource ids with a
//! free/in-use flag per id. `apply(n)` atomically reserves `n` free ids or
//! fails without leaking; `restore(ids)` is idempotent and never fails.
//! Every mutation enqueues a full-pool snapshot to the write-behind queue;
//! on start a scheduler rehydrates from its snapshot or, if none exists,
//! rediscovers the pool from the host.

pub mod cpu;
pub mod discovery;
pub mod gpu;
pub mod port;

pub use cpu::CpuScheduler;
pub use discovery::{GpuDevice, GpuDiscovery, SmiDiscovery, StaticDiscovery};
pub use gpu::GpuScheduler;
pub use port::PortScheduler;

/// Release already-reserved ids back into a pool.
///
/// The controller's compensation guards hold schedulers through this trait
/// so a single guard type covers all three pools.
pub trait RestorePool: Send + Sync {
    fn restore_ids(&self, ids: &[String]);
}
