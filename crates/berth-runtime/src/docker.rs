//! Docker Engine API client
//!
//! Speaks the engine's HTTP API directly (create, start, stop, restart,
//! pause, remove, inspect, exec, commit, tag, list). The engine must expose
//! a TCP endpoint (`DOCKER_HOST=tcp://...`-style); socket activation is the
//! deployment's concern.

use crate::stdcopy;
use crate::{ContainerDetails, ContainerRuntime};
use async_trait::async_trait;
use berth_core::{ContainerRecord, Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Client for the Docker Engine HTTP API
pub struct DockerRuntime {
    endpoint: String,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRequest<'a> {
    image: &'a str,
    cmd: &'a [String],
    env: &'a [String],
    open_stdin: bool,
    tty: bool,
    exposed_ports: BTreeMap<String, serde_json::Value>,
    host_config: HostConfigWire<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfigWire<'a> {
    binds: &'a [String],
    port_bindings: BTreeMap<String, Vec<PortBindingWire>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    device_requests: Vec<DeviceRequestWire<'a>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    cpuset_cpus: String,
    memory: i64,
    shm_size: i64,
    storage_opt: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    runtime: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
struct PortBindingWire {
    host_port: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceRequestWire<'a> {
    driver: &'a str,
    #[serde(rename = "DeviceIDs")]
    device_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectResponse {
    id: String,
    state: InspectState,
    host_config: InspectHostConfig,
    graph_driver: InspectGraphDriver,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectState {
    running: bool,
    paused: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectHostConfig {
    device_requests: Option<Vec<InspectDeviceRequest>>,
    cpuset_cpus: String,
    memory: i64,
    port_bindings: Option<BTreeMap<String, Option<Vec<PortBindingWire>>>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct InspectDeviceRequest {
    #[serde(rename = "DeviceIDs")]
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectGraphDriver {
    data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateRequest<'a> {
    attach_stdout: bool,
    attach_stderr: bool,
    detach_keys: &'a str,
    working_dir: &'a str,
    cmd: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecStartRequest {
    detach: bool,
    tty: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    #[allow(unused)]
    id: String,
}

impl DockerRuntime {
    /// Connect to a Docker Engine endpoint and verify it pings
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::runtime(format!("failed to build docker client: {}", e)))?;

        let runtime = Self { endpoint, client };
        let response = runtime
            .client
            .get(format!("{}/_ping", runtime.endpoint))
            .send()
            .await
            .map_err(|e| Error::runtime(format!("docker connect failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::runtime(format!(
                "docker ping returned {}",
                response.status()
            )));
        }

        info!(endpoint = %runtime.endpoint, "connected to docker engine");
        Ok(runtime)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        // 304 means the container is already in the requested state
        if status.is_success() || status.as_u16() == 304 {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::runtime(format!("{} returned {}: {}", what, status, body)))
    }

    async fn post_empty(&self, path: &str, what: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .send()
            .await
            .map_err(|e| Error::runtime(format!("{} failed: {}", what, e)))?;
        self.check(response, what).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, name: &str, record: &ContainerRecord) -> Result<String> {
        let exposed_ports: BTreeMap<String, serde_json::Value> = record
            .config
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), serde_json::json!({})))
            .collect();
        let port_bindings: BTreeMap<String, Vec<PortBindingWire>> = record
            .host_config
            .port_bindings
            .iter()
            .map(|(port, host)| {
                let bindings = host
                    .iter()
                    .map(|host_port| PortBindingWire {
                        host_port: host_port.clone(),
                    })
                    .collect();
                (port.clone(), bindings)
            })
            .collect();
        let device_requests: Vec<DeviceRequestWire<'_>> = record
            .host_config
            .resources
            .device_requests
            .iter()
            .map(|request| DeviceRequestWire {
                driver: &request.driver,
                device_ids: &request.device_ids,
            })
            .collect();

        let request = CreateRequest {
            image: &record.config.image,
            cmd: &record.config.cmd,
            env: &record.config.env,
            open_stdin: record.config.open_stdin,
            tty: record.config.tty,
            exposed_ports,
            host_config: HostConfigWire {
                binds: &record.host_config.binds,
                port_bindings,
                device_requests,
                cpuset_cpus: record.host_config.resources.cpuset_cpus.clone(),
                memory: record.host_config.resources.memory,
                shm_size: record.host_config.shm_size,
                storage_opt: &record.host_config.storage_opt,
                runtime: record.host_config.runtime.clone(),
            },
        };

        let response = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", name)])
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::runtime(format!("container create failed: {}", e)))?;
        let created: CreateResponse = self
            .check(response, "container create")
            .await?
            .json()
            .await
            .map_err(|e| Error::runtime(format!("invalid create response: {}", e)))?;

        debug!(name, id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.post_empty(&format!("/containers/{}/start", name), "container start")
            .await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.post_empty(&format!("/containers/{}/stop", name), "container stop")
            .await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.post_empty(&format!("/containers/{}/restart", name), "container restart")
            .await
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.post_empty(&format!("/containers/{}/pause", name), "container pause")
            .await
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/containers/{}", name)))
            .query(&[("force", force)])
            .send()
            .await
            .map_err(|e| Error::runtime(format!("container remove failed: {}", e)))?;
        self.check(response, "container remove").await?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{}/json", name)))
            .send()
            .await
            .map_err(|e| Error::runtime(format!("container inspect failed: {}", e)))?;
        let inspect: InspectResponse = self
            .check(response, "container inspect")
            .await?
            .json()
            .await
            .map_err(|e| Error::runtime(format!("invalid inspect response: {}", e)))?;

        let device_ids = inspect
            .host_config
            .device_requests
            .as_ref()
            .and_then(|requests| requests.first())
            .map(|request| request.device_ids.clone())
            .unwrap_or_default();
        let host_ports = inspect
            .host_config
            .port_bindings
            .as_ref()
            .map(|bindings| {
                bindings
                    .values()
                    .flatten()
                    .flatten()
                    .map(|binding| binding.host_port.clone())
                    .collect()
            })
            .unwrap_or_default();
        let upper_dir = inspect
            .graph_driver
            .data
            .get("UpperDir")
            .cloned()
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: inspect.id,
            running: inspect.state.running,
            paused: inspect.state.paused,
            device_ids,
            cpuset_cpus: inspect.host_config.cpuset_cpus,
            memory_bytes: inspect.host_config.memory,
            host_ports,
            upper_dir,
        })
    }

    async fn exec(&self, name: &str, work_dir: &str, cmd: &[String]) -> Result<String> {
        let create_request = ExecCreateRequest {
            attach_stdout: true,
            attach_stderr: true,
            detach_keys: "ctrl-p,q",
            working_dir: if work_dir.is_empty() { "/" } else { work_dir },
            cmd,
        };
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/exec", name)))
            .json(&create_request)
            .send()
            .await
            .map_err(|e| Error::runtime(format!("exec create failed: {}", e)))?;
        let exec: ExecCreateResponse = self
            .check(response, "exec create")
            .await?
            .json()
            .await
            .map_err(|e| Error::runtime(format!("invalid exec create response: {}", e)))?;

        let response = self
            .client
            .post(self.url(&format!("/exec/{}/start", exec.id)))
            .json(&ExecStartRequest {
                detach: false,
                tty: false,
            })
            .send()
            .await
            .map_err(|e| Error::runtime(format!("exec start failed: {}", e)))?;
        let raw = self
            .check(response, "exec start")
            .await?
            .bytes()
            .await
            .map_err(|e| Error::runtime(format!("exec output read failed: {}", e)))?;

        Ok(String::from_utf8_lossy(&stdcopy::demux(&raw)).into_owned())
    }

    async fn commit(&self, name: &str, comment: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url("/commit"))
            .query(&[("container", name), ("comment", comment)])
            .send()
            .await
            .map_err(|e| Error::runtime(format!("container commit failed: {}", e)))?;
        let commit: CommitResponse = self
            .check(response, "container commit")
            .await?
            .json()
            .await
            .map_err(|e| Error::runtime(format!("invalid commit response: {}", e)))?;
        Ok(commit.id)
    }

    async fn tag(&self, image_id: &str, image_name: &str) -> Result<()> {
        let (repo, tag) = match image_name.rsplit_once(':') {
            Some((repo, tag)) if !repo.is_empty() => (repo, tag),
            _ => (image_name, "latest"),
        };
        let response = self
            .client
            .post(self.url(&format!("/images/{}/tag", image_id)))
            .query(&[("repo", repo), ("tag", tag)])
            .send()
            .await
            .map_err(|e| Error::runtime(format!("image tag failed: {}", e)))?;
        self.check(response, "image tag").await?;
        Ok(())
    }

    async fn exists_prefix(&self, prefix: &str) -> Result<bool> {
        let filters = serde_json::json!({ "name": [format!("^{}-", prefix)] }).to_string();
        let response = self
            .client
            .get(self.url("/containers/json"))
            .query(&[("filters", filters.as_str())])
            .send()
            .await
            .map_err(|e| Error::runtime(format!("container list failed: {}", e)))?;
        let entries: Vec<ListEntry> = self
            .check(response, "container list")
            .await?
            .json()
            .await
            .map_err(|e| Error::runtime(format!("invalid list response: {}", e)))?;
        Ok(!entries.is_empty())
    }
}
