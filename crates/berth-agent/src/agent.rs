//! Daemon assembly and lifecycle
//!
//! Boot order matters: store first (everything rehydrates from it), then
//! the write-behind queue, the schedulers, the runtime, the controller with
//! its reconstructed version registry, and the HTTP surface last. Shutdown
//! reverses it: stop serving, write final scheduler snapshots, drain the
//! queue best-effort.

use crate::config::{AgentConfig, GpuDiscoveryMode, RuntimeMode, StoreMode};
use crate::{AgentError, Result};
use berth_api::{ApiKey, AppState};
use berth_controller::ReplicaSetController;
use berth_runtime::{ContainerRuntime, DockerRuntime, MockRuntime};
use berth_sched::{
    CpuScheduler, GpuDiscovery, GpuScheduler, PortScheduler, SmiDiscovery, StaticDiscovery,
};
use berth_store::{EtcdStore, KvStore, MemoryStore, Namespace, WatchEventKind, WriteBehind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bring the daemon up and run until ctrl-c
pub async fn run_agent(config: AgentConfig) -> Result<()> {
    config.validate()?;
    info!(agent = %config.agent.name, "starting berth agent");

    // store
    let store: Arc<dyn KvStore> = match config.store.mode {
        StoreMode::Etcd => Arc::new(EtcdStore::connect(&config.store.endpoint).await?),
        StoreMode::Memory => {
            warn!("using the in-memory store; state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // write-behind queue
    let (queue, worker) = WriteBehind::spawn(store.clone());

    // schedulers
    let discovery: Box<dyn GpuDiscovery> = match config.schedulers.gpu.mode {
        GpuDiscoveryMode::Smi => Box::new(SmiDiscovery),
        GpuDiscoveryMode::Static => {
            if config.schedulers.gpu.uuids.is_empty() {
                Box::new(StaticDiscovery::with_default_gpus())
            } else {
                Box::new(StaticDiscovery::new(config.schedulers.gpu.uuids.clone()))
            }
        }
    };
    let gpus = GpuScheduler::init(store.as_ref(), queue.clone(), discovery.as_ref()).await?;
    let cpus = CpuScheduler::init(store.as_ref(), queue.clone(), config.cpu_count()).await?;
    let port_range = config.schedulers.port_range;
    let ports = PortScheduler::init(
        store.as_ref(),
        queue.clone(),
        port_range.start..port_range.end,
    )
    .await?;

    // runtime
    let runtime: Arc<dyn ContainerRuntime> = match config.runtime.mode {
        RuntimeMode::Docker => Arc::new(DockerRuntime::connect(&config.runtime.endpoint).await?),
        RuntimeMode::Mock => {
            warn!("using the mock runtime; containers are simulated");
            Arc::new(MockRuntime::new(std::env::temp_dir().join("berth-mock")))
        }
    };

    // controller
    let controller = Arc::new(ReplicaSetController::new(
        runtime,
        store.clone(),
        queue.clone(),
        gpus.clone(),
        cpus.clone(),
        ports.clone(),
        config.merge_dir()?,
    ));
    controller.reconstruct().await?;

    spawn_record_watcher(store.as_ref()).await;

    // http surface
    let state = AppState {
        controller,
        gpus: gpus.clone(),
        cpus: cpus.clone(),
        ports: ports.clone(),
        api_key: ApiKey::from_env(),
    };

    tokio::select! {
        result = berth_api::serve(config.http.bind_addr, state) => {
            result.map_err(AgentError::Core)?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    // final snapshots go straight to the store so a crash of the drain
    // cannot lose the pool state
    for (ns, snapshot) in [
        (Namespace::Gpus, gpus.snapshot()),
        (Namespace::Cpus, cpus.snapshot()),
        (Namespace::Ports, ports.snapshot()),
    ] {
        if let Err(e) = store.put(ns, "status", snapshot).await {
            error!(namespace = %ns, error = %e, "final scheduler snapshot failed");
        }
    }

    // release every queue producer, then wait for the consumer to drain
    drop(queue);
    drop(gpus);
    drop(cpus);
    drop(ports);
    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
        warn!("write-behind queue did not drain before shutdown");
    }

    info!("berth agent stopped");
    Ok(())
}

/// Log container record transitions observed in the store
async fn spawn_record_watcher(store: &dyn KvStore) {
    match store.watch(Namespace::Containers).await {
        Ok(mut events) => {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event.kind {
                        WatchEventKind::Put => {
                            info!(key = %event.key, bytes = event.value.len(), "container record written")
                        }
                        WatchEventKind::Delete => {
                            info!(key = %event.key, "container record deleted")
                        }
                    }
                }
            });
        }
        Err(e) => warn!(error = %e, "container record watch unavailable"),
    }
}
