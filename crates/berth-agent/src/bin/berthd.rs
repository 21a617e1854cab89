//! Main binary for the berth daemon (berthd)

use berth_agent::{init_logging, run_agent, AgentConfig, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "berthd")]
#[command(about = "Single-host control plane for GPU-enabled containers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Override configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start { ref config }) => {
            let config_path = config.clone().or(cli.config.clone());
            start(config_path, &cli).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => {
            let config_path = cli.config.clone();
            start(config_path, &cli).await
        }
    }
}

async fn start(config_path: Option<PathBuf>, cli: &Cli) -> Result<()> {
    let mut config = match config_path {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    init_logging(&config.logging)?;

    if let Err(e) = run_agent(config).await {
        error!("agent failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();
    match output {
        Some(path) => {
            config.to_file(&path)?;
            println!("wrote configuration to {}", path.display());
        }
        None => {
            let yaml = serde_yaml::to_string(&config)
                .map_err(berth_agent::AgentError::Yaml)?;
            println!("{}", yaml);
        }
    }
    Ok(())
}

fn validate_config(path: PathBuf) -> Result<()> {
    let config = AgentConfig::from_file(&path)?;
    config.validate()?;
    println!("configuration is valid");
    println!("agent name: {}", config.agent.name);
    println!("http bind: {}", config.http.bind_addr);
    println!(
        "port range: {}..{}",
        config.schedulers.port_range.start, config.schedulers.port_range.end
    );
    Ok(())
}
