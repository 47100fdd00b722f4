use clap::Parser;
use std::path::PathBuf;

/// ITAM endpoint agent
///
/// Sweeps the local subnet, reports discovered devices and a per-cycle
/// security notification to the management backend, then enforces the
/// backend's blocked-website and prohibited-software policy.
#[derive(Parser, Debug)]
#[command(name = "itam-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Seconds between cycles (default: 60, or the config file value)
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
