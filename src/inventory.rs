use serde::Serialize;
use sysinfo::System;
use tracing::debug;

use crate::platform;

/// Static facts about the machine the agent runs on
///
/// Collected once at startup; none of these change while the agent runs.
#[derive(Debug, Clone, Serialize)]
pub struct HostInventory {
    pub agent_name: String,
    pub os_name: String,
    pub device_type: String,
    pub manufacturer: String,
    pub serial: Option<String>,
}

impl HostInventory {
    pub async fn collect() -> Self {
        let agent_name = gethostname::gethostname().to_string_lossy().into_owned();
        let os_name = format!(
            "{} {}",
            System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            System::kernel_version().unwrap_or_default()
        )
        .trim()
        .to_string();

        let inventory = Self {
            agent_name,
            os_name,
            device_type: platform::device_type().to_string(),
            manufacturer: platform::system_manufacturer().await,
            serial: platform::system_serial().await,
        };

        debug!("Host inventory: {:?}", inventory);
        inventory
    }

    /// Name the local host is reported under
    ///
    /// macOS advertises itself over mDNS as `<name>.local`.
    pub fn host_name(&self) -> String {
        if cfg!(target_os = "macos") && !self.agent_name.ends_with(".local") {
            format!("{}.local", self.agent_name)
        } else {
            self.agent_name.clone()
        }
    }
}

/// Point-in-time resource usage of the local host
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub cpu_percent: Option<f32>,
    pub ram_percent: Option<f32>,
    pub battery_percent: Option<f32>,
}

impl HealthSnapshot {
    /// Sample CPU, memory and battery usage
    ///
    /// CPU usage needs two refreshes separated by sysinfo's minimum interval.
    pub async fn sample() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu = sys.global_cpu_info().cpu_usage();
        let ram = if sys.total_memory() > 0 {
            Some(sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0)
        } else {
            None
        };

        Self {
            cpu_percent: Some(round1(cpu)),
            ram_percent: ram.map(round1),
            battery_percent: battery_percent(),
        }
    }
}

fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[cfg(target_os = "linux")]
fn battery_percent() -> Option<f32> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;

    entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("BAT"))
        .find_map(|entry| {
            std::fs::read_to_string(entry.path().join("capacity"))
                .ok()
                .and_then(|raw| raw.trim().parse::<f32>().ok())
        })
}

#[cfg(not(target_os = "linux"))]
fn battery_percent() -> Option<f32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round1_keeps_one_decimal() {
        assert_eq!(round1(12.345), 12.3);
        assert_eq!(round1(99.96), 100.0);
    }

    #[test]
    fn host_name_only_suffixes_on_macos() {
        let inventory = HostInventory {
            agent_name: "build-box".to_string(),
            os_name: "Linux 6.1".to_string(),
            device_type: "Linux Machine".to_string(),
            manufacturer: "Unknown".to_string(),
            serial: None,
        };

        if cfg!(target_os = "macos") {
            assert_eq!(inventory.host_name(), "build-box.local");
        } else {
            assert_eq!(inventory.host_name(), "build-box");
        }
    }

    #[test]
    fn health_snapshot_serializes_missing_values_as_null() {
        let snapshot = HealthSnapshot {
            cpu_percent: Some(3.5),
            ram_percent: None,
            battery_percent: None,
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["cpu_percent"], 3.5);
        assert!(json["ram_percent"].is_null());
    }
}
