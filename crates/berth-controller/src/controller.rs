//! The replica-set controller
//!
//! Drives every lifecycle transition for named replica sets. Operations on
//! the same name are serialized through a per-name mutex; operations on
//! different names proceed concurrently. Resource acquisitions are either
//! committed with the transition or restored on the way out.

use crate::guard::Reservation;
use crate::overlay;
use crate::registry::{MergeMap, VersionRegistry};
use berth_core::{
    Bind, ContainerCommit, ContainerConfig, ContainerExecute, ContainerHistoryItem,
    ContainerRecord, ContainerRun, CpuPatch, DeviceRequest, Error, GpuPatch, HostConfig,
    MemoryPatch, PatchRequest, Resources, Result, RollbackRequest, VolumePatch, LXCFS_BINDS,
};
use berth_core::parse_memory;
use berth_runtime::ContainerRuntime;
use berth_sched::{CpuScheduler, GpuScheduler, PortScheduler};
use berth_store::{KvStore, Namespace, WriteBehind};
use chrono::Local;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

/// Flags for [`ReplicaSetController::stop`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    pub restore_gpu: bool,
    pub restore_cpu: bool,
    pub restore_port: bool,
    /// Resolve the name to its latest versioned container first
    pub is_latest: bool,
}

/// A freshly created container version, not yet published
struct Created {
    id: String,
    versioned_name: String,
    value: Vec<u8>,
}

/// Composes schedulers, runtime, and store into atomic lifecycle operations
pub struct ReplicaSetController {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn KvStore>,
    queue: WriteBehind,
    gpus: Arc<GpuScheduler>,
    cpus: Arc<CpuScheduler>,
    ports: Arc<PortScheduler>,
    versions: VersionRegistry,
    merges: MergeMap,
    merge_root: PathBuf,
    op_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ReplicaSetController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn KvStore>,
        queue: WriteBehind,
        gpus: Arc<GpuScheduler>,
        cpus: Arc<CpuScheduler>,
        ports: Arc<PortScheduler>,
        merge_root: PathBuf,
    ) -> Self {
        Self {
            runtime,
            store,
            queue,
            gpus,
            cpus,
            ports,
            versions: VersionRegistry::new(),
            merges: MergeMap::new(),
            merge_root,
            op_locks: DashMap::new(),
        }
    }

    /// Seed the version registry from the store's live records at boot
    pub async fn reconstruct(&self) -> Result<usize> {
        let live = self.store.list(Namespace::Containers).await?;
        let mut records = Vec::with_capacity(live.len());
        for (key, value) in live {
            match serde_json::from_slice::<ContainerRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "skipping unparsable container record"),
            }
        }
        let seeded = self.versions.reconstruct(records.iter());
        info!(replica_sets = seeded, "version registry reconstructed");
        Ok(seeded)
    }

    /// Run a new replica set: acquire resources, create and start version 1
    pub async fn run(&self, spec: &ContainerRun) -> Result<(String, String)> {
        if spec.replica_set_name.is_empty() {
            return Err(Error::invalid_request("replicaSetName must not be empty"));
        }
        if spec.image_name.is_empty() {
            return Err(Error::invalid_request("imageName must not be empty"));
        }
        let name = spec.replica_set_name.as_str();
        let _op = self.lock_name(name).await;

        if self.runtime.exists_prefix(name).await? {
            return Err(Error::ContainerExisted(name.to_string()));
        }

        let mut record = self.compose_record(spec)?;

        // gpu, then cpu, then memory parse, then (inside run_container) ports;
        // each guard restores on any exit before commit
        let mut gpu_guard = None;
        if spec.gpu_count > 0 {
            let uuids = self.gpus.apply(spec.gpu_count)?;
            info!(container = name, gpus = uuids.len(), uuids = ?uuids, "gpus applied");
            record.host_config.resources.device_requests = vec![DeviceRequest::gpus(uuids.clone())];
            gpu_guard = Some(Reservation::new(self.gpus.clone(), uuids));
        }

        let mut cpu_guard = None;
        if spec.cpu_count > 0 {
            let ids = self.cpus.apply(spec.cpu_count)?;
            info!(container = name, cpus = ids.len(), cpuset = ?ids, "cpus applied");
            record.host_config.resources.cpuset_cpus = ids.join(",");
            cpu_guard = Some(Reservation::new(self.cpus.clone(), ids));
        }

        if !spec.memory.is_empty() {
            record.host_config.resources.memory = parse_memory(&spec.memory)?;
        }

        let created = self.run_container(name, record, false).await?;

        if let Some(guard) = gpu_guard {
            self.gpus.alloc(name, guard.commit());
        }
        if let Some(guard) = cpu_guard {
            guard.commit();
        }
        self.queue
            .put(Namespace::Containers, name, created.value.clone());

        info!(container = %created.versioned_name, id = %created.id, "replica set running");
        Ok((created.id, created.versioned_name))
    }

    /// Replace the live version with a patched one, carrying the overlay
    /// upper directory across
    pub async fn patch(&self, name: &str, spec: &PatchRequest) -> Result<(String, String)> {
        let _op = self.lock_name(name).await;
        let (version, old_versioned) = self.current_version(name)?;

        let bytes = self.store.get(Namespace::Containers, name).await?;
        let mut record: ContainerRecord = serde_json::from_slice(&bytes)?;

        let gpu_applied = self
            .patch_gpu(&old_versioned, spec.gpu_patch.as_ref(), &mut record)
            .await?;
        let cpu_applied = match self
            .patch_cpu(&old_versioned, spec.cpu_patch.as_ref(), &mut record)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.restore_applied(&gpu_applied, &None);
                return Err(e);
            }
        };
        if let Err(e) = self
            .patch_memory(&old_versioned, spec.memory_patch.as_ref(), &mut record)
            .await
        {
            self.restore_applied(&gpu_applied, &cpu_applied);
            return Err(e);
        }
        patch_volume(spec.volume_patch.as_ref(), &mut record);

        let created = match self.run_container(name, record.clone(), true).await {
            Ok(created) => created,
            Err(e) => {
                self.restore_applied(&gpu_applied, &cpu_applied);
                return Err(e);
            }
        };

        // carry the old upper layer into the new container before it starts
        let carried: Result<()> = async {
            overlay::remove_ballast(self.runtime.as_ref(), &old_versioned).await?;
            overlay::copy_upper(self.runtime.as_ref(), &old_versioned, &created.versioned_name)
                .await?;
            self.start_container(&created.id, &created.versioned_name)
                .await
        }
        .await;
        if let Err(e) = carried {
            self.abort_replacement(name, &created, version).await;
            self.restore_applied(&gpu_applied, &cpu_applied);
            return Err(e);
        }

        self.finish_replacement(name, version, &old_versioned, &created, &record)
            .await;
        info!(old = %old_versioned, new = %created.versioned_name, "replica set patched");
        Ok((created.id, created.versioned_name))
    }

    /// Recreate a historical configuration version as the new live version
    pub async fn rollback(&self, name: &str, spec: &RollbackRequest) -> Result<String> {
        let _op = self.lock_name(name).await;
        let (version, old_versioned) = self.current_version(name)?;
        if spec.version == version {
            return Err(Error::NoRollbackRequired(spec.version));
        }

        let bytes = self
            .store
            .revision(Namespace::Containers, name, spec.version)
            .await?;
        let mut record: ContainerRecord = serde_json::from_slice(&bytes)?;

        // compute resource deltas against the live container by re-running
        // the patch logic with the historical values as targets
        let gpu_target = record.host_config.resources.gpu_ids().len();
        let gpu_applied = self
            .patch_gpu(
                &old_versioned,
                Some(&GpuPatch {
                    gpu_count: gpu_target,
                }),
                &mut record,
            )
            .await?;
        let cpu_target = record.host_config.resources.cpuset_list().len();
        let cpu_applied = match self
            .patch_cpu(
                &old_versioned,
                Some(&CpuPatch {
                    cpu_count: cpu_target,
                }),
                &mut record,
            )
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.restore_applied(&gpu_applied, &None);
                return Err(e);
            }
        };
        // the historical byte count is the memory target, compared against
        // the live limit without a lossy unit-string round trip
        let memory_target = record.host_config.resources.memory;
        if let Err(e) = self
            .patch_memory_bytes(&old_versioned, memory_target, &mut record)
            .await
        {
            self.restore_applied(&gpu_applied, &cpu_applied);
            return Err(e);
        }

        // started immediately; the historical upper layer carries over after
        let created = match self.run_container(name, record.clone(), false).await {
            Ok(created) => created,
            Err(e) => {
                self.restore_applied(&gpu_applied, &cpu_applied);
                return Err(e);
            }
        };

        if let Err(e) =
            overlay::copy_upper(self.runtime.as_ref(), &old_versioned, &created.versioned_name)
                .await
        {
            self.abort_replacement(name, &created, version).await;
            self.restore_applied(&gpu_applied, &cpu_applied);
            return Err(e);
        }

        self.finish_replacement(name, version, &old_versioned, &created, &record)
            .await;
        info!(old = %old_versioned, new = %created.versioned_name, target = spec.version, "replica set rolled back");
        Ok(created.versioned_name)
    }

    /// Re-apply the live configuration as a fresh version; resource ids may
    /// differ, counts do not
    pub async fn restart(&self, name: &str) -> Result<(String, String)> {
        let _op = self.lock_name(name).await;
        let (version, old_versioned) = self.current_version(name)?;

        let details = self.runtime.inspect(&old_versioned).await?;
        let live = details.running || details.paused;

        let bytes = self.store.get(Namespace::Containers, name).await?;
        let mut record: ContainerRecord = serde_json::from_slice(&bytes)?;

        let mut gpu_applied = None;
        if !details.device_ids.is_empty() {
            if live {
                self.gpus.restore(&details.device_ids);
            }
            let uuids = self.gpus.apply(details.device_ids.len())?;
            info!(container = %old_versioned, gpus = uuids.len(), uuids = ?uuids, "gpus reapplied");
            record.host_config.resources.device_requests = vec![DeviceRequest::gpus(uuids.clone())];
            gpu_applied = Some(uuids);
        }

        let mut cpu_applied = None;
        let held_cpus = details.cpuset_list();
        if !held_cpus.is_empty() {
            if live {
                self.cpus.restore(&held_cpus);
            }
            match self.cpus.apply(held_cpus.len()) {
                Ok(ids) => {
                    info!(container = %old_versioned, cpus = ids.len(), cpuset = ?ids, "cpus reapplied");
                    record.host_config.resources.cpuset_cpus = ids.join(",");
                    cpu_applied = Some(ids);
                }
                Err(e) => {
                    self.restore_applied(&gpu_applied, &None);
                    return Err(e);
                }
            }
        }

        if details.memory_bytes != 0 {
            record.host_config.resources.memory = details.memory_bytes;
        }

        // host ports are freshly allocated by the run path; the old
        // container's are released when it is removed below
        let created = match self.run_container(name, record.clone(), true).await {
            Ok(created) => created,
            Err(e) => {
                self.restore_applied(&gpu_applied, &cpu_applied);
                return Err(e);
            }
        };

        let carried: Result<()> = async {
            overlay::remove_ballast(self.runtime.as_ref(), &old_versioned).await?;
            overlay::copy_upper(self.runtime.as_ref(), &old_versioned, &created.versioned_name)
                .await?;
            self.start_container(&created.id, &created.versioned_name)
                .await
        }
        .await;
        if let Err(e) = carried {
            self.abort_replacement(name, &created, version).await;
            self.restore_applied(&gpu_applied, &cpu_applied);
            return Err(e);
        }

        self.finish_replacement(name, version, &old_versioned, &created, &record)
            .await;
        info!(old = %old_versioned, new = %created.versioned_name, "replica set restarted");
        Ok((created.id, created.versioned_name))
    }

    /// In-place restart of the live versioned container
    pub async fn startup(&self, name: &str) -> Result<()> {
        let _op = self.lock_name(name).await;
        let (_, versioned) = self.current_version(name)?;
        self.runtime.restart(&versioned).await?;
        info!(container = %versioned, "container started up");
        Ok(())
    }

    /// Stop a container, optionally restoring its held resources first
    pub async fn stop(&self, name: &str, opts: StopOptions) -> Result<()> {
        let _op = self.lock_name(name).await;
        let target = if opts.is_latest {
            self.current_version(name)?.1
        } else {
            name.to_string()
        };

        let mut restored_gpus = Vec::new();
        let mut restored_cpus = Vec::new();
        if opts.restore_gpu || opts.restore_cpu || opts.restore_port {
            let details = self.runtime.inspect(&target).await?;
            if opts.restore_gpu {
                restored_gpus = details.device_ids.clone();
                self.gpus.restore(&restored_gpus);
                info!(container = %target, gpus = restored_gpus.len(), "gpus restored");
            }
            if opts.restore_cpu {
                restored_cpus = details.cpuset_list();
                self.cpus.restore(&restored_cpus);
                info!(container = %target, cpus = restored_cpus.len(), "cpus restored");
            }
            if opts.restore_port {
                self.ports.restore(&details.host_ports);
                info!(container = %target, ports = details.host_ports.len(), "ports restored");
            }
        }

        if let Err(e) = self.runtime.stop(&target).await {
            // idempotent re-restore keeps the pools consistent
            self.gpus.restore(&restored_gpus);
            self.cpus.restore(&restored_cpus);
            return Err(e);
        }

        info!(container = %target, "container stopped");
        Ok(())
    }

    /// Pause the live versioned container
    pub async fn pause(&self, name: &str) -> Result<()> {
        let _op = self.lock_name(name).await;
        let (_, versioned) = self.current_version(name)?;
        self.runtime.pause(&versioned).await?;
        info!(container = %versioned, "container paused");
        Ok(())
    }

    /// Destroy the replica set: free resources, drop the record, remove the
    /// preserved overlay tree and the live container
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _op = self.lock_name(name).await;
        let (_, versioned) = self.current_version(name)?;

        let details = self.runtime.inspect(&versioned).await?;
        if details.running || details.paused {
            self.gpus.restore(&details.device_ids);
            info!(container = name, gpus = details.device_ids.len(), "gpus restored");
            let cpus = details.cpuset_list();
            self.cpus.restore(&cpus);
            info!(container = name, cpus = cpus.len(), "cpus restored");
            self.ports.restore(&details.host_ports);
            info!(container = name, ports = details.host_ports.len(), "ports restored");
        }

        self.remove_merge_tree(name)?;
        self.merges.remove_name(name);
        self.versions.remove(name);
        self.gpus.dealloc(name);
        self.queue.delete(Namespace::Containers, name);

        self.runtime.remove(&versioned, true).await?;
        info!(container = %versioned, "replica set deleted");
        Ok(())
    }

    /// Run a command in the live versioned container and capture its output
    pub async fn execute(&self, name: &str, spec: &ContainerExecute) -> Result<String> {
        let (_, versioned) = self.current_version(name)?;
        let work_dir = if spec.work_dir.is_empty() {
            "/"
        } else {
            spec.work_dir.as_str()
        };
        let output = self.runtime.exec(&versioned, work_dir, &spec.cmd).await?;
        info!(container = %versioned, cmd = ?spec.cmd, "command executed");
        Ok(output)
    }

    /// Snapshot the live versioned container into an image
    pub async fn commit(&self, name: &str, spec: &ContainerCommit) -> Result<String> {
        let (_, versioned) = self.current_version(name)?;
        let comment = format!(
            "container name {}, commit time: {}",
            versioned,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let image_id = self.runtime.commit(&versioned, &comment).await?;

        let image_name = if spec.new_image_name.is_empty() {
            image_id.clone()
        } else {
            self.runtime.tag(&image_id, &spec.new_image_name).await?;
            spec.new_image_name.clone()
        };
        info!(container = %versioned, image = %image_name, "container committed");
        Ok(image_name)
    }

    /// The live record of a replica set
    pub async fn info(&self, name: &str) -> Result<ContainerRecord> {
        let bytes = self.store.get(Namespace::Containers, name).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every historical configuration version of a replica set
    pub async fn history(&self, name: &str) -> Result<Vec<ContainerHistoryItem>> {
        let revisions = self.store.range(Namespace::Containers, name).await?;
        let mut items = Vec::with_capacity(revisions.len());
        for (revision, value) in revisions {
            let record: ContainerRecord = serde_json::from_slice(&value)?;
            items.push(ContainerHistoryItem {
                revision,
                create_time: record.create_time.clone(),
                record,
            });
        }
        Ok(items)
    }

    // --- internals ---

    async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .op_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn current_version(&self, name: &str) -> Result<(i64, String)> {
        let version = self.versions.get(name).ok_or_else(|| {
            Error::not_found(format!("replica set {} has no live version", name))
        })?;
        Ok((version, format!("{}-{}", name, version)))
    }

    /// Initial record for a run request, with the host defaults applied
    fn compose_record(&self, spec: &ContainerRun) -> Result<ContainerRecord> {
        let mut binds: Vec<String> = spec.binds.iter().map(Bind::format).collect();
        binds.extend(LXCFS_BINDS.iter().map(|bind| bind.to_string()));

        let exposed_ports: Vec<String> = spec
            .container_ports
            .iter()
            .map(|port| format!("{}/tcp", port))
            .collect();
        let port_bindings: BTreeMap<String, Option<String>> = exposed_ports
            .iter()
            .map(|port| (port.clone(), None))
            .collect();

        let mut storage_opt = BTreeMap::new();
        storage_opt.insert("size".to_string(), "30G".to_string());

        Ok(ContainerRecord {
            config: ContainerConfig {
                image: spec.image_name.clone(),
                cmd: spec.cmd.clone(),
                env: spec.env.clone(),
                exposed_ports,
                open_stdin: true,
                tty: true,
            },
            host_config: HostConfig {
                binds,
                port_bindings,
                resources: Resources::default(),
                storage_opt,
                shm_size: parse_memory("256GB")?,
                runtime: "nvidia".to_string(),
            },
            replica_set_name: spec.replica_set_name.clone(),
            ..Default::default()
        })
    }

    /// Reserve the next version, allocate host ports, create (and unless
    /// `only_create`, start) the container, and serialize the final record.
    /// The version counter rolls back if anything fails.
    async fn run_container(
        &self,
        name: &str,
        mut record: ContainerRecord,
        only_create: bool,
    ) -> Result<Created> {
        let previous = self.versions.get(name).unwrap_or(0);
        let version = previous + 1;
        self.versions.set(name, version);

        match self
            .create_version(name, &mut record, version, only_create)
            .await
        {
            Ok(created) => Ok(created),
            Err(e) => {
                if previous == 0 {
                    self.versions.remove(name);
                } else {
                    self.versions.set(name, previous);
                }
                Err(e)
            }
        }
    }

    async fn create_version(
        &self,
        name: &str,
        record: &mut ContainerRecord,
        version: i64,
        only_create: bool,
    ) -> Result<Created> {
        record.version = version;
        record.replica_set_name = name.to_string();
        record.config.set_version_env(version);

        let mut port_guard = None;
        if !record.host_config.port_bindings.is_empty() {
            let allocated = self.ports.apply(record.host_config.port_bindings.len())?;
            info!(container = name, ports = ?allocated, "host ports applied");
            for (slot, port) in record
                .host_config
                .port_bindings
                .values_mut()
                .zip(allocated.iter())
            {
                *slot = Some(port.clone());
            }
            port_guard = Some(Reservation::new(self.ports.clone(), allocated));
        }

        let versioned_name = format!("{}-{}", name, version);
        record.container_name = versioned_name.clone();
        record.stamp_create_time();

        let id = self.runtime.create(&versioned_name, record).await?;
        if !only_create {
            self.start_container(&id, &versioned_name).await?;
        }

        if let Some(guard) = port_guard {
            guard.commit();
        }
        let value = serde_json::to_vec(record)?;
        info!(container = %versioned_name, only_create, "container version created");
        Ok(Created {
            id,
            versioned_name,
            value,
        })
    }

    async fn start_container(&self, id: &str, versioned_name: &str) -> Result<()> {
        if let Err(e) = self.runtime.start(id).await {
            let _ = self.runtime.remove(id, true).await;
            return Err(e);
        }
        overlay::spawn_ballast_writer(self.runtime.clone(), versioned_name.to_string());
        Ok(())
    }

    /// GPU patch step. Returns the newly applied uuids, or `None` when the
    /// step was a no-op or only released.
    async fn patch_gpu(
        &self,
        versioned: &str,
        patch: Option<&GpuPatch>,
        record: &mut ContainerRecord,
    ) -> Result<Option<Vec<String>>> {
        let details = self.runtime.inspect(versioned).await?;
        let live = details.running || details.paused;
        let held = details.device_ids;

        if let Some(patch) = patch {
            // same count on a live container: leave it alone
            if held.len() == patch.gpu_count && live {
                return Ok(None);
            }
        }
        let target = patch.map(|p| p.gpu_count).unwrap_or(held.len());

        if live && !held.is_empty() {
            self.gpus.restore(&held);
            info!(container = versioned, gpus = held.len(), uuids = ?held, "gpus restored");
        }

        if target == 0 {
            // drop the device request entirely, keeping the memory limit
            record.host_config.resources = Resources {
                memory: record.host_config.resources.memory,
                ..Default::default()
            };
            return Ok(None);
        }

        let uuids = self.gpus.apply(target)?;
        info!(container = versioned, gpus = uuids.len(), uuids = ?uuids, "gpus applied");
        record.host_config.resources.device_requests = vec![DeviceRequest::gpus(uuids.clone())];
        Ok(Some(uuids))
    }

    /// CPU patch step; same shape as the GPU step
    async fn patch_cpu(
        &self,
        versioned: &str,
        patch: Option<&CpuPatch>,
        record: &mut ContainerRecord,
    ) -> Result<Option<Vec<String>>> {
        let details = self.runtime.inspect(versioned).await?;
        let live = details.running || details.paused;
        let held = details.cpuset_list();

        if let Some(patch) = patch {
            if held.len() == patch.cpu_count && live {
                return Ok(None);
            }
        }
        let target = patch.map(|p| p.cpu_count).unwrap_or(held.len());

        if live && !held.is_empty() {
            self.cpus.restore(&held);
            info!(container = versioned, cpus = held.len(), "cpus restored");
        }

        // unlike the gpu step there is no zero carve-out: the scheduler
        // rejects a zero count and the rejection propagates
        let ids = self.cpus.apply(target)?;
        info!(container = versioned, cpus = ids.len(), cpuset = ?ids, "cpus applied");
        record.host_config.resources.cpuset_cpus = ids.join(",");
        Ok(Some(ids))
    }

    /// Memory patch step: parse the target, no-op when it matches the live
    /// limit
    async fn patch_memory(
        &self,
        versioned: &str,
        patch: Option<&MemoryPatch>,
        record: &mut ContainerRecord,
    ) -> Result<()> {
        let Some(patch) = patch else { return Ok(()) };
        let target = parse_memory(&patch.memory)?;
        self.patch_memory_bytes(versioned, target, record).await
    }

    /// Memory step with an exact byte target, used by rollback where the
    /// historical record supplies the byte count directly
    async fn patch_memory_bytes(
        &self,
        versioned: &str,
        target: i64,
        record: &mut ContainerRecord,
    ) -> Result<()> {
        let details = self.runtime.inspect(versioned).await?;
        if details.memory_bytes == target {
            return Ok(());
        }
        record.host_config.resources.memory = target;
        Ok(())
    }

    fn restore_applied(&self, gpus: &Option<Vec<String>>, cpus: &Option<Vec<String>>) {
        if let Some(ids) = gpus {
            self.gpus.restore(ids);
        }
        if let Some(ids) = cpus {
            self.cpus.restore(ids);
        }
    }

    /// Undo a created-but-unpublished version: free its host ports, remove
    /// the container, and roll the version counter back
    async fn abort_replacement(&self, name: &str, created: &Created, prior_version: i64) {
        if let Ok(details) = self.runtime.inspect(&created.versioned_name).await {
            self.ports.restore(&details.host_ports);
        }
        if let Err(e) = self.runtime.remove(&created.versioned_name, true).await {
            error!(container = %created.versioned_name, error = %e, "abort removal failed");
        }
        self.versions.set(name, prior_version);
    }

    /// Cleanup after the new version is live. Failures here are logged but
    /// never undo the transition: the new container keeps running and the
    /// record is published regardless.
    async fn finish_replacement(
        &self,
        name: &str,
        old_version: i64,
        old_versioned: &str,
        created: &Created,
        record: &ContainerRecord,
    ) {
        if let Err(e) = self.preserve_merge(name, old_versioned, old_version) {
            error!(container = old_versioned, error = %e, "merge preservation failed");
        }
        if let Err(e) = self.remove_for_update(old_versioned).await {
            error!(container = old_versioned, error = %e, "old container removal failed; it is orphaned");
        }

        let gpu_ids = record.host_config.resources.gpu_ids();
        if gpu_ids.is_empty() {
            self.gpus.dealloc(name);
        } else {
            self.gpus.alloc(name, gpu_ids.to_vec());
        }

        self.queue
            .put(Namespace::Containers, name, created.value.clone());
    }

    /// Record the old version's overlay location under the merge root
    fn preserve_merge(&self, name: &str, old_versioned: &str, old_version: i64) -> Result<()> {
        let path = self.merge_root.join(name).join(old_versioned);
        if let Err(e) = std::fs::create_dir_all(&path) {
            self.merges.remove(name, old_version);
            return Err(e.into());
        }
        self.merges.set(name, old_version, path);
        Ok(())
    }

    fn remove_merge_tree(&self, name: &str) -> Result<()> {
        let path = self.merge_root.join(name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "merge tree removal failed, path {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Release the old container's host ports and force-remove it
    async fn remove_for_update(&self, versioned: &str) -> Result<()> {
        let details = self.runtime.inspect(versioned).await?;
        self.ports.restore(&details.host_ports);
        info!(container = versioned, ports = details.host_ports.len(), "ports restored");
        self.runtime.remove(versioned, true).await?;
        info!(container = versioned, "old version removed");
        Ok(())
    }
}

/// Volume patch step: replace the first matching bind in place
fn patch_volume(patch: Option<&VolumePatch>, record: &mut ContainerRecord) {
    let Some(patch) = patch else { return };
    if patch.old_bind.format() == patch.new_bind.format() {
        return;
    }
    for bind in record.host_config.binds.iter_mut() {
        if *bind == patch.old_bind.format() {
            *bind = patch.new_bind.format();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::MockRuntime;
    use berth_sched::StaticDiscovery;
    use berth_store::MemoryStore;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Harness {
        controller: Arc<ReplicaSetController>,
        runtime: Arc<MockRuntime>,
        store: Arc<MemoryStore>,
        gpus: Arc<GpuScheduler>,
        cpus: Arc<CpuScheduler>,
        ports: Arc<PortScheduler>,
        worker: JoinHandle<()>,
        dir: TempDir,
    }

    impl Harness {
        /// 8 GPUs, 16 CPUs, ports 40000..40009, empty store
        async fn fresh() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let (queue, worker) = WriteBehind::spawn(store.clone());
            let gpus = GpuScheduler::init(
                store.as_ref(),
                queue.clone(),
                &StaticDiscovery::with_default_gpus(),
            )
            .await
            .unwrap();
            let cpus = CpuScheduler::init(store.as_ref(), queue.clone(), 16)
                .await
                .unwrap();
            let ports = PortScheduler::init(store.as_ref(), queue.clone(), 40000..40010)
                .await
                .unwrap();
            let runtime = Arc::new(MockRuntime::new(dir.path().join("containers")));
            let controller = Arc::new(ReplicaSetController::new(
                runtime.clone(),
                store.clone(),
                queue,
                gpus.clone(),
                cpus.clone(),
                ports.clone(),
                dir.path().join("merges"),
            ));
            Self {
                controller,
                runtime,
                store,
                gpus,
                cpus,
                ports,
                worker,
                dir,
            }
        }

        fn gpu_in_use(&self) -> usize {
            self.gpus.status().values().filter(|used| **used).count()
        }

        fn cpu_in_use(&self) -> usize {
            self.cpus.status().values().filter(|used| **used).count()
        }

        fn port_in_use(&self) -> usize {
            self.ports.status().values().filter(|used| **used).count()
        }

        /// Block until the write-behind consumer has flushed `n` container
        /// revisions for `key`
        async fn wait_for_revisions(&self, key: &str, n: usize) {
            for _ in 0..200 {
                if let Ok(history) = self.store.range(Namespace::Containers, key).await {
                    if history.len() >= n {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("store never reached {} revisions for {}", n, key);
        }

        /// Drop every queue producer and wait for the consumer to drain
        async fn drain(self) -> (Arc<MemoryStore>, Arc<MockRuntime>, TempDir) {
            let Harness {
                controller,
                runtime,
                store,
                gpus,
                cpus,
                ports,
                worker,
                dir,
            } = self;
            drop(controller);
            drop(gpus);
            drop(cpus);
            drop(ports);
            worker.await.unwrap();
            (store, runtime, dir)
        }
    }

    fn run_spec() -> ContainerRun {
        ContainerRun {
            image_name: "img".to_string(),
            replica_set_name: "job".to_string(),
            gpu_count: 2,
            cpu_count: 4,
            memory: "8GB".to_string(),
            container_ports: vec!["22".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_successful_gpu_run() {
        let harness = Harness::fresh().await;

        let (id, container_name) = harness.controller.run(&run_spec()).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(container_name, "job-1");

        assert_eq!(harness.gpu_in_use(), 2);
        assert_eq!(harness.cpu_in_use(), 4);
        assert_eq!(harness.port_in_use(), 1);
        // lowest cpu ids first
        let cpu_status = harness.cpus.status();
        for id in ["0", "1", "2", "3"] {
            assert_eq!(cpu_status.get(id), Some(&true), "cpu {} should be in use", id);
        }
        assert_eq!(harness.gpus.alloc_map().get("job").map(Vec::len), Some(2));

        let (store, runtime, _dir) = harness.drain().await;
        let record: ContainerRecord = serde_json::from_slice(
            &store.get(Namespace::Containers, "job").await.unwrap(),
        )
        .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.container_name, "job-1");
        assert!(record.config.env.contains(&"CONTAINER_VERSION=1".to_string()));
        assert_eq!(record.host_config.resources.memory, 8 * 1024 * 1024 * 1024);
        let host_port = record.host_config.port_bindings["22/tcp"].clone().unwrap();
        assert!(host_port.starts_with("4000"));
        assert!(runtime.inspect("job-1").await.unwrap().running);
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_rolls_back_partial_acquisition() {
        let harness = Harness::fresh().await;
        // drain the cpu pool entirely
        harness.cpus.apply(16).unwrap();

        let err = harness.controller.run(&run_spec()).await.unwrap_err();
        assert!(matches!(err, Error::CpuNotEnough { .. }));
        // the 2 acquired gpus were restored
        assert_eq!(harness.gpu_in_use(), 0);
        assert_eq!(harness.port_in_use(), 0);
        assert_eq!(harness.controller.versions.get("job"), None);
    }

    #[tokio::test]
    async fn test_run_rejects_duplicate_name() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        let err = harness.controller.run(&run_spec()).await.unwrap_err();
        assert!(matches!(err, Error::ContainerExisted(_)));
    }

    #[tokio::test]
    async fn test_create_failure_restores_everything() {
        let harness = Harness::fresh().await;
        harness.runtime.set_fail_create(true);

        let err = harness.controller.run(&run_spec()).await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert_eq!(harness.gpu_in_use(), 0);
        assert_eq!(harness.cpu_in_use(), 0);
        assert_eq!(harness.port_in_use(), 0);
        // the version reservation rolled back too
        assert_eq!(harness.controller.versions.get("job"), None);
    }

    #[tokio::test]
    async fn test_patch_grows_gpus() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let patch = PatchRequest {
            gpu_patch: Some(GpuPatch { gpu_count: 4 }),
            ..Default::default()
        };
        let (_, new_name) = harness.controller.patch("job", &patch).await.unwrap();
        assert_eq!(new_name, "job-2");
        assert_eq!(harness.gpu_in_use(), 4);

        let (store, runtime, _dir) = harness.drain().await;
        assert_eq!(runtime.container_names(), ["job-2"]);
        let history = store.range(Namespace::Containers, "job").await.unwrap();
        assert_eq!(history.len(), 2);
        let live: ContainerRecord = serde_json::from_slice(
            &store.get(Namespace::Containers, "job").await.unwrap(),
        )
        .unwrap();
        assert_eq!(live.version, 2);
        assert_eq!(live.host_config.resources.gpu_ids().len(), 4);
    }

    #[tokio::test]
    async fn test_patch_same_counts_is_noop_except_version() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let patch = PatchRequest {
            gpu_patch: Some(GpuPatch { gpu_count: 2 }),
            cpu_patch: Some(CpuPatch { cpu_count: 4 }),
            memory_patch: Some(MemoryPatch {
                memory: "8GB".to_string(),
            }),
            ..Default::default()
        };
        let (_, new_name) = harness.controller.patch("job", &patch).await.unwrap();
        assert_eq!(new_name, "job-2");
        // per-field no-ops: nothing was released or re-applied
        assert_eq!(harness.gpu_in_use(), 2);
        assert_eq!(harness.cpu_in_use(), 4);
    }

    #[tokio::test]
    async fn test_patch_volume_replaces_bind() {
        let harness = Harness::fresh().await;
        let mut spec = run_spec();
        spec.binds = vec![Bind::new("/data", "/mnt")];
        harness.controller.run(&spec).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let patch = PatchRequest {
            volume_patch: Some(VolumePatch {
                old_bind: Bind::new("/data", "/mnt"),
                new_bind: Bind::new("/fast-data", "/mnt"),
            }),
            ..Default::default()
        };
        harness.controller.patch("job", &patch).await.unwrap();

        let (store, _runtime, _dir) = harness.drain().await;
        let live: ContainerRecord = serde_json::from_slice(
            &store.get(Namespace::Containers, "job").await.unwrap(),
        )
        .unwrap();
        assert!(live.host_config.binds.contains(&"/fast-data:/mnt".to_string()));
        assert!(!live.host_config.binds.contains(&"/data:/mnt".to_string()));
    }

    #[tokio::test]
    async fn test_rollback_restores_older_configuration() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let patch = PatchRequest {
            gpu_patch: Some(GpuPatch { gpu_count: 4 }),
            ..Default::default()
        };
        harness.controller.patch("job", &patch).await.unwrap();
        harness.wait_for_revisions("job", 2).await;
        assert_eq!(harness.gpu_in_use(), 4);

        let new_name = harness
            .controller
            .rollback("job", &RollbackRequest { version: 1 })
            .await
            .unwrap();
        assert_eq!(new_name, "job-3");
        assert_eq!(harness.gpu_in_use(), 2);

        // rolling back to the now-live version is refused
        let err = harness
            .controller
            .rollback("job", &RollbackRequest { version: 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRollbackRequired(3)));

        let (_store, runtime, _dir) = harness.drain().await;
        assert_eq!(runtime.container_names(), ["job-3"]);
    }

    #[tokio::test]
    async fn test_patch_cpu_to_zero_is_rejected() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let patch = PatchRequest {
            cpu_patch: Some(CpuPatch { cpu_count: 0 }),
            ..Default::default()
        };
        let err = harness.controller.patch("job", &patch).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        // the released cpus stay released and no new version was minted
        assert_eq!(harness.cpu_in_use(), 0);
        assert_eq!(harness.controller.versions.get("job"), Some(1));
    }

    #[tokio::test]
    async fn test_rollback_preserves_exact_memory_bytes() {
        let harness = Harness::fresh().await;
        let mut spec = run_spec();
        spec.memory = "500MB".to_string();
        harness.controller.run(&spec).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let patch = PatchRequest {
            memory_patch: Some(MemoryPatch {
                memory: "1GB".to_string(),
            }),
            ..Default::default()
        };
        harness.controller.patch("job", &patch).await.unwrap();
        harness.wait_for_revisions("job", 2).await;

        harness
            .controller
            .rollback("job", &RollbackRequest { version: 1 })
            .await
            .unwrap();
        harness.wait_for_revisions("job", 3).await;

        // the sub-GiB historical limit survives rollback byte for byte
        let live = harness.controller.info("job").await.unwrap();
        assert_eq!(live.host_config.resources.memory, 500 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_restart_reapplies_same_counts() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let (_, new_name) = harness.controller.restart("job").await.unwrap();
        assert_eq!(new_name, "job-2");
        assert_eq!(harness.gpu_in_use(), 2);
        assert_eq!(harness.cpu_in_use(), 4);
        assert_eq!(harness.port_in_use(), 1);

        let (_store, runtime, _dir) = harness.drain().await;
        assert_eq!(runtime.container_names(), ["job-2"]);
    }

    #[tokio::test]
    async fn test_delete_frees_everything() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;
        let merge_root = harness.dir.path().join("merges");

        harness.controller.delete("job").await.unwrap();
        assert_eq!(harness.gpu_in_use(), 0);
        assert_eq!(harness.cpu_in_use(), 0);
        assert_eq!(harness.port_in_use(), 0);
        assert_eq!(harness.controller.versions.get("job"), None);
        assert!(harness.gpus.alloc_map().is_empty());
        assert!(!merge_root.join("job").exists());

        let (store, runtime, _dir) = harness.drain().await;
        assert!(store.get(Namespace::Containers, "job").await.is_err());
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_stop_restores_flagged_resources() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();

        harness
            .controller
            .stop(
                "job",
                StopOptions {
                    restore_gpu: true,
                    restore_cpu: true,
                    restore_port: true,
                    is_latest: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(harness.gpu_in_use(), 0);
        assert_eq!(harness.cpu_in_use(), 0);
        assert_eq!(harness.port_in_use(), 0);
        assert!(!harness.runtime.inspect("job-1").await.unwrap().running);
    }

    #[tokio::test]
    async fn test_pause_and_startup() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();

        harness.controller.pause("job").await.unwrap();
        assert!(harness.runtime.inspect("job-1").await.unwrap().paused);

        harness.controller.startup("job").await.unwrap();
        let details = harness.runtime.inspect("job-1").await.unwrap();
        assert!(details.running);
        assert!(!details.paused);
    }

    #[tokio::test]
    async fn test_execute_and_commit() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();

        harness
            .controller
            .execute(
                "job",
                &ContainerExecute {
                    work_dir: String::new(),
                    cmd: vec!["ls".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(
            harness.runtime.exec_history("job-1"),
            vec![vec!["ls".to_string()]]
        );

        let image = harness
            .controller
            .commit(
                "job",
                &ContainerCommit {
                    new_image_name: "img:v2".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(image, "img:v2");
    }

    #[tokio::test]
    async fn test_history_lists_all_revisions() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;
        harness
            .controller
            .patch(
                "job",
                &PatchRequest {
                    gpu_patch: Some(GpuPatch { gpu_count: 4 }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        harness.wait_for_revisions("job", 2).await;

        let history = harness.controller.history("job").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 1);
        assert_eq!(history[0].record.version, 1);
        assert_eq!(history[1].record.version, 2);

        let live = harness.controller.info("job").await.unwrap();
        assert_eq!(live.version, 2);
    }

    #[tokio::test]
    async fn test_reconstruct_seeds_versions_from_store() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        let fresh = ReplicaSetController::new(
            harness.runtime.clone(),
            harness.store.clone(),
            WriteBehind::spawn(harness.store.clone()).0,
            harness.gpus.clone(),
            harness.cpus.clone(),
            harness.ports.clone(),
            harness.dir.path().join("merges"),
        );
        assert_eq!(fresh.reconstruct().await.unwrap(), 1);
        assert_eq!(fresh.versions.get("job"), Some(1));
    }

    #[tokio::test]
    async fn test_version_sequence_has_no_gaps() {
        let harness = Harness::fresh().await;
        harness.controller.run(&run_spec()).await.unwrap();
        harness.wait_for_revisions("job", 1).await;

        for expected in 2..5 {
            harness.controller.restart("job").await.unwrap();
            harness.wait_for_revisions("job", expected as usize).await;
            assert_eq!(harness.controller.versions.get("job"), Some(expected));
        }

        let history = harness.controller.history("job").await.unwrap();
        let versions: Vec<i64> = history.iter().map(|item| item.record.version).collect();
        assert_eq!(versions, [1, 2, 3, 4]);
    }
}
