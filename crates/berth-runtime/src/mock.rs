//! In-memory mock runtime
//!
//! Backs controller tests and the local development mode. Containers are
//! plain map entries; upper directories are real directories under a base
//! path so the overlay-copy path can be exercised end to end.

use crate::{ContainerDetails, ContainerRuntime};
use async_trait::async_trait;
use berth_core::{ContainerRecord, Error, Result};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    running: bool,
    paused: bool,
    device_ids: Vec<String>,
    cpuset_cpus: String,
    memory_bytes: i64,
    host_ports: Vec<String>,
    upper_dir: String,
}

/// A [`ContainerRuntime`] that lives entirely in process
pub struct MockRuntime {
    containers: DashMap<String, MockContainer>,
    exec_log: DashMap<String, Vec<Vec<String>>>,
    base_dir: PathBuf,
    next_id: AtomicU64,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
}

impl MockRuntime {
    /// `base_dir` hosts one fake upper directory per created container
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            containers: DashMap::new(),
            exec_log: DashMap::new(),
            base_dir: base_dir.into(),
            next_id: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Make subsequent `create` calls fail, for compensation tests
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `start` calls fail, for compensation tests
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Commands executed in a container, oldest first
    pub fn exec_history(&self, name: &str) -> Vec<Vec<String>> {
        self.exec_log
            .get(name)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Names of all containers currently known to the runtime
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn entry(&self, name: &str) -> Result<MockContainer> {
        self.containers
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::runtime(format!("no such container: {}", name)))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, name: &str, record: &ContainerRecord) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::runtime("mock create failure"));
        }
        if self.containers.contains_key(name) {
            return Err(Error::runtime(format!("container {} already exists", name)));
        }

        let id = format!("mock-{:012}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let upper_dir = self.base_dir.join(name).join("diff");
        std::fs::create_dir_all(&upper_dir)?;

        let host_ports = record
            .host_config
            .port_bindings
            .values()
            .flatten()
            .cloned()
            .collect();
        self.containers.insert(
            name.to_string(),
            MockContainer {
                id: id.clone(),
                running: false,
                paused: false,
                device_ids: record.host_config.resources.gpu_ids().to_vec(),
                cpuset_cpus: record.host_config.resources.cpuset_cpus.clone(),
                memory_bytes: record.host_config.resources.memory,
                host_ports,
                upper_dir: upper_dir.to_string_lossy().into_owned(),
            },
        );
        debug!(name, id = %id, "mock container created");
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::runtime("mock start failure"));
        }
        // start accepts either the name or the id, like the engine
        for mut entry in self.containers.iter_mut() {
            if entry.key() == name || entry.id == name {
                entry.running = true;
                entry.paused = false;
                return Ok(());
            }
        }
        Err(Error::runtime(format!("no such container: {}", name)))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut entry = self
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::runtime(format!("no such container: {}", name)))?;
        entry.running = false;
        entry.paused = false;
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let mut entry = self
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::runtime(format!("no such container: {}", name)))?;
        entry.running = true;
        entry.paused = false;
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        let mut entry = self
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::runtime(format!("no such container: {}", name)))?;
        if !entry.running {
            return Err(Error::runtime(format!("container {} is not running", name)));
        }
        entry.paused = true;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let Some((_, container)) = self.containers.remove(name) else {
            return Err(Error::runtime(format!("no such container: {}", name)));
        };
        if container.running && !force {
            self.containers.insert(name.to_string(), container);
            return Err(Error::runtime(format!("container {} is running", name)));
        }
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        let container = self.entry(name)?;
        Ok(ContainerDetails {
            id: container.id,
            running: container.running,
            paused: container.paused,
            device_ids: container.device_ids,
            cpuset_cpus: container.cpuset_cpus,
            memory_bytes: container.memory_bytes,
            host_ports: container.host_ports,
            upper_dir: container.upper_dir,
        })
    }

    async fn exec(&self, name: &str, _work_dir: &str, cmd: &[String]) -> Result<String> {
        self.entry(name)?;
        self.exec_log
            .entry(name.to_string())
            .or_default()
            .push(cmd.to_vec());
        Ok(String::new())
    }

    async fn commit(&self, name: &str, _comment: &str) -> Result<String> {
        let container = self.entry(name)?;
        Ok(format!("sha256:mock-{}", container.id))
    }

    async fn tag(&self, _image_id: &str, _image_name: &str) -> Result<()> {
        Ok(())
    }

    async fn exists_prefix(&self, prefix: &str) -> Result<bool> {
        let prefix = format!("{}-", prefix);
        Ok(self.containers.iter().any(|entry| {
            entry.key().starts_with(&prefix) && entry.running
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{DeviceRequest, Resources};

    fn record_with_gpus(uuids: Vec<String>) -> ContainerRecord {
        let mut record = ContainerRecord::default();
        record.host_config.resources = Resources {
            device_requests: vec![DeviceRequest::gpus(uuids)],
            cpuset_cpus: "0,1".to_string(),
            memory: 1024,
        };
        record
    }

    #[tokio::test]
    async fn test_lifecycle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new(dir.path());
        let record = record_with_gpus(vec!["GPU-0".to_string()]);

        let id = runtime.create("job-1", &record).await.unwrap();
        assert!(!id.is_empty());

        runtime.start("job-1").await.unwrap();
        let details = runtime.inspect("job-1").await.unwrap();
        assert!(details.running);
        assert_eq!(details.device_ids, ["GPU-0"]);
        assert!(!details.upper_dir.is_empty());

        runtime.pause("job-1").await.unwrap();
        assert!(runtime.inspect("job-1").await.unwrap().paused);

        runtime.remove("job-1", true).await.unwrap();
        assert!(runtime.inspect("job-1").await.is_err());
    }

    #[tokio::test]
    async fn test_exists_prefix_matches_running_only() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new(dir.path());
        let record = ContainerRecord::default();

        runtime.create("job-1", &record).await.unwrap();
        assert!(!runtime.exists_prefix("job").await.unwrap());

        runtime.start("job-1").await.unwrap();
        assert!(runtime.exists_prefix("job").await.unwrap());
        // the versioned-name separator is part of the match
        assert!(!runtime.exists_prefix("jo").await.unwrap());
        assert!(!runtime.exists_prefix("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_flags() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new(dir.path());
        runtime.set_fail_create(true);
        assert!(runtime
            .create("job-1", &ContainerRecord::default())
            .await
            .is_err());

        runtime.set_fail_create(false);
        runtime.create("job-1", &ContainerRecord::default()).await.unwrap();
        runtime.set_fail_start(true);
        assert!(runtime.start("job-1").await.is_err());
    }
}
