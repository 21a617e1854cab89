//! Container configuration model and lifecycle request types
//!
//! `ContainerRecord` is the unit of persistence: one JSON document per
//! replica-set name, rewritten on every version transition. The request
//! types mirror the HTTP payloads accepted by the API layer.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bind mounts injected into every container so in-container `/proc` views
/// reflect the cgroup limits rather than the host.
pub const LXCFS_BINDS: [&str; 6] = [
    "/var/lib/lxcfs/proc/cpuinfo:/proc/cpuinfo:rw",
    "/var/lib/lxcfs/proc/diskstats:/proc/diskstats:rw",
    "/var/lib/lxcfs/proc/meminfo:/proc/meminfo:rw",
    "/var/lib/lxcfs/proc/stat:/proc/stat:rw",
    "/var/lib/lxcfs/proc/swaps:/proc/swaps:rw",
    "/var/lib/lxcfs/proc/uptime:/proc/uptime:rw",
];

/// Environment variable carrying the container's version number
pub const CONTAINER_VERSION_ENV: &str = "CONTAINER_VERSION";

/// A host path bound into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
    pub src: String,
    pub dest: String,
}

impl Bind {
    pub fn new(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
        }
    }

    /// The `src:dest` form used in host configuration bind lists
    pub fn format(&self) -> String {
        format!("{}:{}", self.src, self.dest)
    }
}

/// GPU device request passed to the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub driver: String,
    pub device_ids: Vec<String>,
}

impl DeviceRequest {
    /// Device request for a set of GPU uuids under the CDI driver
    pub fn gpus(device_ids: Vec<String>) -> Self {
        Self {
            driver: "cdi".to_string(),
            device_ids,
        }
    }
}

/// Resource limits applied to a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub device_requests: Vec<DeviceRequest>,
    pub cpuset_cpus: String,
    pub memory: i64,
}

impl Resources {
    /// The GPU uuids currently held by this resource set
    pub fn gpu_ids(&self) -> &[String] {
        self.device_requests
            .first()
            .map(|r| r.device_ids.as_slice())
            .unwrap_or(&[])
    }

    /// The cpuset as a list of logical CPU id strings
    pub fn cpuset_list(&self) -> Vec<String> {
        if self.cpuset_cpus.is_empty() {
            return Vec::new();
        }
        self.cpuset_cpus.split(',').map(str::to_string).collect()
    }
}

/// Container-side configuration (image, command, environment)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub open_stdin: bool,
    pub tty: bool,
}

impl ContainerConfig {
    /// Set or update the `CONTAINER_VERSION` environment variable in place
    pub fn set_version_env(&mut self, version: i64) {
        let entry = format!("{}={}", CONTAINER_VERSION_ENV, version);
        for env in self.env.iter_mut() {
            if env.starts_with("CONTAINER_VERSION=") {
                *env = entry;
                return;
            }
        }
        self.env.push(entry);
    }
}

/// Host-side configuration (mounts, ports, resource limits)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub binds: Vec<String>,
    /// Container port (e.g. `"22/tcp"`) to allocated host port
    pub port_bindings: BTreeMap<String, Option<String>>,
    pub resources: Resources,
    pub storage_opt: BTreeMap<String, String>,
    pub shm_size: i64,
    pub runtime: String,
}

/// Networking configuration. Kept as an opaque document; the controller
/// composes containers on the default bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingConfig {
    pub endpoints: BTreeMap<String, serde_json::Value>,
}

/// Target platform for the created container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// The persisted record of one replica-set configuration version.
///
/// The live record sits at `containers/<replica-set name>`; every historical
/// write stays addressable by its per-key revision number for rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub version: i64,
    pub create_time: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networking_config: NetworkingConfig,
    pub platform: Platform,
    pub container_name: String,
    pub replica_set_name: String,
}

impl ContainerRecord {
    /// Stamp the record's creation time with the local wall clock
    pub fn stamp_create_time(&mut self) {
        self.create_time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    }
}

/// Request to run a new replica set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRun {
    pub image_name: String,
    pub replica_set_name: String,
    #[serde(default)]
    pub gpu_count: usize,
    #[serde(default)]
    pub cpu_count: usize,
    /// Memory limit with unit suffix, e.g. `"8GB"`
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub binds: Vec<Bind>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Container-side ports to expose; one host port is allocated per entry
    #[serde(default)]
    pub container_ports: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuPatch {
    pub gpu_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuPatch {
    pub cpu_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPatch {
    pub memory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePatch {
    pub old_bind: Bind,
    pub new_bind: Bind,
}

/// Per-field resource patch; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub gpu_patch: Option<GpuPatch>,
    pub cpu_patch: Option<CpuPatch>,
    pub memory_patch: Option<MemoryPatch>,
    pub volume_patch: Option<VolumePatch>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExecute {
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCommit {
    #[serde(default)]
    pub new_image_name: String,
}

/// One historical configuration version of a replica set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHistoryItem {
    pub revision: i64,
    pub create_time: String,
    pub record: ContainerRecord,
}
