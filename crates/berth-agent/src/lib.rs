//! # berth-agent
//!
//! Wires the berth components into a running daemon: configuration loading,
//! logging, store and runtime connections, scheduler bootstrap, version
//! registry reconstruction, and the HTTP server lifecycle.

pub mod agent;
pub mod config;

pub use agent::run_agent;
pub use config::AgentConfig;

/// Errors raised while bringing the daemon up or down
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] berth_core::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and tracing from the agent configuration
pub fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }

    Ok(())
}
