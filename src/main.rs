use anyhow::{Context, Result};
use clap::Parser;

mod agent;
mod archive;
mod cache;
mod cli;
mod enforcement;
mod inventory;
mod malware;
mod platform;
mod policy;
mod report;
mod resolver;
mod scanner;
mod transport;

use cli::Args;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = agent::AgentConfig::resolve(args.config.as_deref(), args.interval)
        .context("Failed to load agent configuration")?;

    init_logging(args.verbose, &config.logging.level);

    if config.backend.api_key.is_empty() {
        tracing::warn!("No backend API key configured; the backend will likely reject requests");
    }

    if let Err(e) = platform::ensure_admin_privileges() {
        tracing::warn!("Insufficient privileges: {:#}", e);
        tracing::warn!("Hosts file, firewall and process enforcement will likely fail");
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(agent::run_agent_daemon(config, args.once))
}

/// Initialize logging
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
fn init_logging(verbose: bool, configured_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { configured_level };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}
