//! `cadenced` — runs configured jobs on time-of-day schedules.

use anyhow::Context;
use cadence_core::config::{default_config_path, CadenceConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod daemon;
mod pidfile;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CADENCE_GIT_SHA"), ")");

/// Cron-like process scheduler.
#[derive(Parser, Debug)]
#[command(name = "cadenced")]
#[command(about = "Run jobs on second/minute/hour schedules")]
#[command(version = VERSION)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE", env = "CADENCE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Run the scheduler until SIGINT/SIGTERM (default).
    #[default]
    Run,
    /// Validate the configuration, every schedule and every code unit.
    Check,
    /// Print the configured job table with time to next firing.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // explicit flag / CADENCE_CONFIG > ~/.cadence/cadence.toml
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = CadenceConfig::load(Some(&config_path))
        .with_context(|| format!("loading configuration from {config_path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str())),
        )
        .init();

    match cli.command.unwrap_or_default() {
        Command::Run => daemon::run(config_path, config).await,
        Command::Check => commands::check(&config),
        Command::Status => commands::status(&config),
    }
}
