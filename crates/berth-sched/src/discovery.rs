//! GPU discovery providers
//!
//! Topology is discovered once at boot through a pluggable provider:
//! a static uuid list for development and tests, or a one-shot
//! `nvidia-smi` probe on real hosts.

use berth_core::{Error, Result};
use std::process::Command;

/// One discovered GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: usize,
    pub uuid: String,
}

/// Source of the host's GPU inventory
pub trait GpuDiscovery: Send + Sync {
    fn discover(&self) -> Result<Vec<GpuDevice>>;
}

/// A fixed, configured GPU inventory
pub struct StaticDiscovery {
    uuids: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(uuids: Vec<String>) -> Self {
        Self { uuids }
    }

    /// Eight placeholder devices, the development default
    pub fn with_default_gpus() -> Self {
        Self::new((0..8).map(|i| format!("GPU-{}", i)).collect())
    }
}

impl GpuDiscovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<GpuDevice>> {
        Ok(self
            .uuids
            .iter()
            .enumerate()
            .map(|(index, uuid)| GpuDevice {
                index,
                uuid: uuid.clone(),
            })
            .collect())
    }
}

/// Probes the host once via `nvidia-smi`
pub struct SmiDiscovery;

const SMI_ARGS: [&str; 2] = ["--query-gpu=index,uuid", "--format=csv,noheader,nounits"];

impl GpuDiscovery for SmiDiscovery {
    fn discover(&self) -> Result<Vec<GpuDevice>> {
        let output = Command::new("nvidia-smi")
            .args(SMI_ARGS)
            .output()
            .map_err(|e| Error::internal(format!("nvidia-smi failed to run: {}", e)))?;
        if !output.status.success() {
            return Err(Error::internal(format!(
                "nvidia-smi exited with {}",
                output.status
            )));
        }
        parse_smi_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `nvidia-smi --query-gpu=index,uuid --format=csv,noheader` output
fn parse_smi_output(output: &str) -> Result<Vec<GpuDevice>> {
    let mut devices = Vec::new();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(2, ", ");
        let (Some(index_str), Some(uuid)) = (fields.next(), fields.next()) else {
            return Err(Error::internal(format!("invalid nvidia-smi line: {}", line)));
        };
        let index: usize = index_str
            .trim()
            .parse()
            .map_err(|_| Error::internal(format!("invalid gpu index: {}", index_str)))?;
        devices.push(GpuDevice {
            index,
            uuid: uuid.trim().to_string(),
        });
    }
    Ok(devices)
}
