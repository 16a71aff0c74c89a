//! bastion - connection-admission firewall for game servers.
//!
//! ```bash
//! bastion init-config --output bastion.toml
//! bastion check-config --config bastion.toml
//! bastion run --config bastion.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bastion_proxy::{ProxyConfig, ShieldProxy};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG_PATH: &str = "/etc/bastion/bastion.toml";
const DEFAULT_LOG_FILTER: &str = "bastion=info,bastion_proxy=info,bastion_admission=info,bastion_audit=info";

/// Connection-admission firewall for game servers.
#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(about = "Connection-admission firewall for game servers")]
#[command(version)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "BASTION_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy.
    Run {
        /// Path to configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "BASTION_CONFIG")]
        config: PathBuf,
    },

    /// Write a default configuration file.
    InitConfig {
        /// Output path for the configuration file.
        #[arg(short, long, default_value = "bastion.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file and print a summary.
    CheckConfig {
        /// Path to configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "BASTION_CONFIG")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::InitConfig { output, force } => init_config(&output, force),
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    info!(config = %config_path.display(), "Starting bastion");

    let config = ProxyConfig::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let proxy = ShieldProxy::new(config).context("failed to build admission pipeline")?;

    let shutdown = proxy.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        shutdown.cancel();
    });

    proxy.run().await?;
    info!("bastion stopped");
    Ok(())
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let content = ProxyConfig::default().to_toml()?;
    std::fs::write(output, content)
        .with_context(|| format!("failed to write config to {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

fn check_config(config_path: &Path) -> Result<()> {
    let config = ProxyConfig::from_file(config_path)?;

    println!("Configuration OK: {}", config_path.display());
    println!("  listen:          {}", config.listen);
    println!("  backend:         {}", config.backend);
    println!("  max connections: {}", config.max_connections);
    println!(
        "  per-address cap: {}",
        config.shield.registry.max_connections_per_address
    );
    println!(
        "  rate limit:      {} per {:?}",
        config.shield.limiter.max_events_per_window,
        config.shield.limiter.window()
    );
    println!("  failure policy:  {:?}", config.shield.detection.failure_policy);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["bastion", "run", "--config", "/tmp/b.toml"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(cli.command, Commands::Run { config } if config == PathBuf::from("/tmp/b.toml")));
    }

    #[test]
    fn test_cli_parses_json_log_format() {
        let cli = Cli::try_parse_from(["bastion", "check-config", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.toml");

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        check_config(&path).unwrap();
    }
}
