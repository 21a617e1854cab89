//! # berth-runtime
//!
//! The container-runtime seam. The controller drives containers through the
//! [`ContainerRuntime`] trait; [`DockerRuntime`] implements it against the
//! Docker Engine HTTP API, and [`MockRuntime`] implements it in memory for
//! tests and local development.

pub mod docker;
pub mod mock;
pub mod stdcopy;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

use async_trait::async_trait;
use berth_core::{ContainerRecord, Result};

/// The live facts the controller reads back from the runtime
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    pub paused: bool,
    /// GPU uuids held through the device request
    pub device_ids: Vec<String>,
    /// cpuset string, e.g. `"0,1,2,3"`
    pub cpuset_cpus: String,
    pub memory_bytes: i64,
    /// Host ports bound to this container
    pub host_ports: Vec<String>,
    /// Overlay upper directory on the host
    pub upper_dir: String,
}

impl ContainerDetails {
    /// The cpuset as a list of logical CPU id strings
    pub fn cpuset_list(&self) -> Vec<String> {
        if self.cpuset_cpus.is_empty() {
            return Vec::new();
        }
        self.cpuset_cpus.split(',').map(str::to_string).collect()
    }
}

/// Client for a single-host container runtime.
///
/// All methods address containers by name or id interchangeably, the way
/// the engine API does.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container from a record; returns the runtime's container id
    async fn create(&self, name: &str, record: &ContainerRecord) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// In-place restart of an existing container
    async fn restart(&self, name: &str) -> Result<()>;

    async fn pause(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    async fn inspect(&self, name: &str) -> Result<ContainerDetails>;

    /// Run a command in the container with stdout and stderr captured;
    /// returns the decoded output
    async fn exec(&self, name: &str, work_dir: &str, cmd: &[String]) -> Result<String>;

    /// Snapshot the container into an image; returns the image id
    async fn commit(&self, name: &str, comment: &str) -> Result<String>;

    /// Tag an image id with a name (`repo[:tag]`)
    async fn tag(&self, image_id: &str, image_name: &str) -> Result<()>;

    /// Whether any running container's name starts with `<prefix>-`
    async fn exists_prefix(&self, prefix: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpuset_list() {
        let details = ContainerDetails {
            cpuset_cpus: "0,1,5".to_string(),
            ..Default::default()
        };
        assert_eq!(details.cpuset_list(), ["0", "1", "5"]);
        assert!(ContainerDetails::default().cpuset_list().is_empty());
    }
}
