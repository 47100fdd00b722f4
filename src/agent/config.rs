use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform;

/// Agent configuration
///
/// Every field carries a compiled-in default, so an agent deployed without a
/// config file behaves exactly like the stock build.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub enforcement: EnforcementSettings,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Management backend endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_dashboard_url")]
    pub url: String,

    /// Sent as `X-API-Key`
    #[serde(default = "default_api_key")]
    pub api_key: String,

    #[serde(default = "default_devices_endpoint")]
    pub devices_endpoint: String,

    #[serde(default = "default_websites_endpoint")]
    pub websites_endpoint: String,

    #[serde(default = "default_software_endpoint")]
    pub software_endpoint: String,

    /// Timeout for record submission (seconds)
    #[serde(default = "default_post_timeout")]
    pub post_timeout: u64,

    /// Timeout for policy fetches (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,

    /// Account label embedded in discovery data
    #[serde(default = "default_account")]
    pub account: String,
}

/// Cycle scheduling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    /// Seconds between the end of one cycle and the start of the next
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Random extra delay added to each sleep (seconds)
    #[serde(default)]
    pub poll_jitter: u64,

    /// Pause between consecutive device submissions (milliseconds)
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,

    /// Appended-to CSV archive of every sweep
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
}

/// Subnet sweep tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanSettings {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Addresses probed sequentially by one worker
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on concurrent workers (also capped at 4x cores)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

/// Delivery cache persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_cache_ttl_days")]
    pub ttl_days: i64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

/// Policy enforcement channels
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnforcementSettings {
    #[serde(default = "default_hosts_path")]
    pub hosts_path: PathBuf,

    /// Comment appended to every hosts line the agent owns
    #[serde(default = "default_hosts_marker")]
    pub hosts_marker: String,

    /// Name shared by every firewall rule the agent owns
    #[serde(default = "default_firewall_rule_name")]
    pub firewall_rule_name: String,

    /// Scanned for installers in addition to the well-known download dirs
    #[serde(default)]
    pub extra_download_dirs: Vec<PathBuf>,
}

/// Fixed location reported with every record
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationConfig {
    #[serde(default = "default_location_name")]
    pub name: String,
    #[serde(default = "default_latitude")]
    pub latitude: String,
    #[serde(default = "default_longitude")]
    pub longitude: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_dashboard_url() -> String {
    option_env!("ITAM_DASHBOARD_URL")
        .unwrap_or("https://itam.galactis.ai")
        .to_string()
}

fn default_api_key() -> String {
    option_env!("ITAM_API_KEY").unwrap_or_default().to_string()
}

fn default_devices_endpoint() -> String {
    "/api/pending-devices".to_string()
}

fn default_websites_endpoint() -> String {
    "/api/agent/blocked-websites".to_string()
}

fn default_software_endpoint() -> String {
    "/api/prohibited-software".to_string()
}

fn default_post_timeout() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    20
}

fn default_account() -> String {
    "inexocast".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_send_delay_ms() -> u64 {
    150
}

fn default_csv_path() -> PathBuf {
    platform::home_dir().join("network_discovery.csv")
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    32
}

fn default_max_workers() -> usize {
    64
}

fn default_cache_path() -> PathBuf {
    platform::home_dir().join(".itam_agent_sent.json")
}

fn default_cache_ttl_days() -> i64 {
    30
}

fn default_cache_max_entries() -> usize {
    50_000
}

fn default_hosts_path() -> PathBuf {
    platform::hosts_file_path()
}

fn default_hosts_marker() -> String {
    "# finecons-agent-block".to_string()
}

fn default_firewall_rule_name() -> String {
    "FineconsAgentBlock".to_string()
}

fn default_location_name() -> String {
    "Chennai, Tamil Nadu".to_string()
}

fn default_latitude() -> String {
    "13.0827".to_string()
}

fn default_longitude() -> String {
    "80.2707".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_dashboard_url(),
            api_key: default_api_key(),
            devices_endpoint: default_devices_endpoint(),
            websites_endpoint: default_websites_endpoint(),
            software_endpoint: default_software_endpoint(),
            post_timeout: default_post_timeout(),
            fetch_timeout: default_fetch_timeout(),
            account: default_account(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            poll_jitter: 0,
            send_delay_ms: default_send_delay_ms(),
            csv_path: default_csv_path(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_days: default_cache_ttl_days(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            hosts_path: default_hosts_path(),
            hosts_marker: default_hosts_marker(),
            firewall_rule_name: default_firewall_rule_name(),
            extra_download_dirs: Vec::new(),
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            name: default_location_name(),
            latitude: default_latitude(),
            longitude: default_longitude(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ScanSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl AgentConfig {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolve the effective configuration at startup
    ///
    /// An explicitly requested file must exist. The platform default file is
    /// optional; without it the compiled-in defaults apply. A command-line
    /// interval replaces the file's before anything is validated.
    pub fn resolve(explicit: Option<&Path>, interval_override: Option<u64>) -> Result<Self> {
        let default_path = platform::agent_config_path();
        let mut config = match explicit {
            Some(path) => Self::parse_file(path)?,
            None if default_path.exists() => Self::parse_file(&default_path)?,
            None => Self::default(),
        };

        if let Some(interval) = interval_override {
            config.agent.poll_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Full URL of a backend endpoint
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.backend.url.trim_end_matches('/'), endpoint)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.backend.url).context("Invalid backend URL")?;

        if url.scheme() != "https" {
            anyhow::bail!("Backend URL must use HTTPS (got: {})", url.scheme());
        }

        if self.agent.poll_interval == 0 {
            anyhow::bail!("Poll interval must be at least 1 second");
        }

        if self.scan.batch_size == 0 {
            anyhow::bail!("Scan batch size must be at least 1");
        }

        if self.scan.max_workers == 0 {
            anyhow::bail!("Scan worker limit must be at least 1");
        }

        if self.cache.ttl_days <= 0 {
            anyhow::bail!("Cache retention must be at least 1 day (got: {})", self.cache.ttl_days);
        }

        if self.enforcement.hosts_marker.trim().is_empty() {
            anyhow::bail!("Hosts marker must not be empty");
        }

        if self.enforcement.firewall_rule_name.trim().is_empty() {
            anyhow::bail!("Firewall rule name must not be empty");
        }

        Ok(())
    }
}
