//! # berth-core
//!
//! Core types and utilities shared across all berth components.
//!
//! This crate provides:
//! - The unified error taxonomy and result type
//! - Container configuration structs and the persisted container record
//! - Request/response data transfer types for the lifecycle API
//! - Memory-string parsing (`"8GB"`, `"1.5TB"`, ...)

pub mod container;
pub mod error;
pub mod memory;

// Re-export commonly used types at the crate root
pub use container::{
    Bind, ContainerCommit, ContainerConfig, ContainerExecute, ContainerHistoryItem,
    ContainerRecord, ContainerRun, CpuPatch, DeviceRequest, GpuPatch, HostConfig, LXCFS_BINDS,
    MemoryPatch, NetworkingConfig, PatchRequest, Platform, Resources, RollbackRequest, VolumePatch,
};
pub use error::{Error, Result};
pub use memory::parse_memory;
