//! Configuration for the berth daemon

use crate::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Complete configuration for the berth daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub logging: LoggingConfig,
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub runtime: RuntimeConfig,
    pub schedulers: SchedulersConfig,
}

/// Daemon identity and paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Agent name, used in logs
    pub name: String,

    /// Where preserved overlay upper directories are kept; defaults to
    /// `merges/` under the working directory
    pub merge_dir: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "berth".to_string(),
            merge_dir: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2378".parse().expect("valid default bind addr"),
        }
    }
}

/// Key-value store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// etcd v3 JSON gateway
    Etcd,
    /// In-process store; state is lost on exit
    Memory,
}

/// Key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub mode: StoreMode,
    pub endpoint: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::Etcd,
            endpoint: "http://127.0.0.1:2379".to_string(),
        }
    }
}

/// Container runtime backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Docker Engine HTTP API
    Docker,
    /// In-process mock runtime for development
    Mock,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    pub endpoint: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Docker,
            endpoint: "http://127.0.0.1:2375".to_string(),
        }
    }
}

/// GPU discovery provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuDiscoveryMode {
    /// Fixed uuid list from configuration
    Static,
    /// One-shot nvidia-smi probe at boot
    Smi,
}

/// GPU discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuDiscoveryConfig {
    pub mode: GpuDiscoveryMode,
    /// uuids for static mode; empty means the development default of
    /// GPU-0..GPU-7
    pub uuids: Vec<String>,
}

impl Default for GpuDiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: GpuDiscoveryMode::Static,
            uuids: Vec::new(),
        }
    }
}

/// Host port range handed to the port scheduler
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 40000,
            end: 42000,
        }
    }
}

/// Scheduler bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulersConfig {
    pub port_range: PortRange,

    /// Logical CPU count override; defaults to the host's processor count
    pub cpu_count: Option<usize>,

    pub gpu: GpuDiscoveryConfig,
}

impl Default for SchedulersConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            cpu_count: None,
            gpu: GpuDiscoveryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Write configuration to a YAML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Check the configuration for contradictions before starting
    pub fn validate(&self) -> Result<()> {
        if self.agent.name.is_empty() {
            return Err(AgentError::Config("agent.name must not be empty".into()));
        }
        if self.schedulers.port_range.start >= self.schedulers.port_range.end {
            return Err(AgentError::Config(format!(
                "schedulers.port_range is empty: {}..{}",
                self.schedulers.port_range.start, self.schedulers.port_range.end
            )));
        }
        if let Some(count) = self.schedulers.cpu_count {
            if count == 0 {
                return Err(AgentError::Config(
                    "schedulers.cpu_count must be greater than 0".into(),
                ));
            }
        }
        if self.store.endpoint.is_empty() {
            return Err(AgentError::Config("store.endpoint must not be empty".into()));
        }
        Ok(())
    }

    /// The directory preserved overlays live under
    pub fn merge_dir(&self) -> Result<PathBuf> {
        match &self.agent.merge_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?.join("merges")),
        }
    }

    /// The logical CPU count to seed the scheduler with
    pub fn cpu_count(&self) -> usize {
        self.schedulers.cpu_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.mode, StoreMode::Etcd);
        assert_eq!(config.runtime.mode, RuntimeMode::Docker);
        assert!(config.cpu_count() >= 1);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = AgentConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.yaml");
        config.to_file(&path).unwrap();

        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.agent.name, config.agent.name);
        assert_eq!(loaded.http.bind_addr, config.http.bind_addr);
        assert_eq!(loaded.schedulers.port_range.start, 40000);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "store:\n  mode: memory\nschedulers:\n  port_range:\n    start: 40000\n    end: 40010\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.mode, StoreMode::Memory);
        assert_eq!(config.schedulers.port_range.end, 40010);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_empty_port_range() {
        let mut config = AgentConfig::default();
        config.schedulers.port_range = PortRange {
            start: 41000,
            end: 41000,
        };
        assert!(config.validate().is_err());
    }
}
