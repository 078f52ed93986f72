//! sibd: SIBVault server daemon
//!
//! Usage:
//!   sibd [--config /etc/sibvault/sibvault.toml] [--listen 0.0.0.0:6543]

mod daemon;
mod metrics;
mod shield;
mod tls;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sib_core::config::SibConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sibd", version, about = "SIBVault secure storage server")]
struct Cli {
    /// Path to sibvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SIBVAULT_CONFIG",
        default_value = "/etc/sibvault/sibvault.toml"
    )]
    config: PathBuf,

    /// Listen address, overrides server.listen
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides log.level
    #[arg(long, env = "SIBVAULT_LOG")]
    log: Option<String>,

    /// Log format, overrides log.format
    #[arg(long, env = "SIBVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SibConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    let level = cli.log.unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if !cli.config.exists() {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "sibd starting"
    );

    daemon::run(config).await
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
