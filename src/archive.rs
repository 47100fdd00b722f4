use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::agent::LocationConfig;
use crate::inventory::{HealthSnapshot, HostInventory};
use crate::report::HostRecord;

const HEADER: [&str; 14] = [
    "timestamp",
    "type",
    "name",
    "ipAddress",
    "macAddress",
    "os_name",
    "device_type",
    "manufacturer",
    "location",
    "latitude",
    "longitude",
    "serial",
    "cpu_percent",
    "battery_percent",
];

/// One archived sighting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveRow {
    pub kind: &'static str,
    pub name: String,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub os_name: Option<String>,
    pub device_type: String,
    pub manufacturer: Option<String>,
    pub location: ArchiveLocation,
    pub serial: Option<String>,
    pub cpu_percent: Option<f32>,
    pub battery_percent: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveLocation {
    pub name: String,
    pub latitude: String,
    pub longitude: String,
}

impl From<&LocationConfig> for ArchiveLocation {
    fn from(location: &LocationConfig) -> Self {
        Self {
            name: location.name.clone(),
            latitude: location.latitude.clone(),
            longitude: location.longitude.clone(),
        }
    }
}

impl ArchiveRow {
    /// Row describing the machine the agent runs on
    pub fn local_host(
        inventory: &HostInventory,
        ip: Option<Ipv4Addr>,
        mac: Option<String>,
        health: &HealthSnapshot,
        location: &LocationConfig,
    ) -> Self {
        Self {
            kind: "host",
            name: inventory.host_name(),
            ip_address: ip.unwrap_or(Ipv4Addr::LOCALHOST).to_string(),
            mac_address: mac,
            os_name: Some(inventory.os_name.clone()),
            device_type: inventory.device_type.clone(),
            manufacturer: Some(inventory.manufacturer.clone()),
            location: location.into(),
            serial: inventory.serial.clone(),
            cpu_percent: health.cpu_percent,
            battery_percent: health.battery_percent,
        }
    }

    /// Row for a swept device; host-only columns stay blank
    pub fn device(host: &HostRecord, location: &LocationConfig) -> Self {
        Self {
            kind: "device",
            name: host.hostname.clone(),
            ip_address: host.ip.to_string(),
            mac_address: host.mac.clone(),
            device_type: "Unknown".to_string(),
            location: location.into(),
            ..Default::default()
        }
    }

    fn fields(&self, timestamp: &str) -> [String; 14] {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(ToString::to_string).unwrap_or_default()
        }

        [
            timestamp.to_string(),
            self.kind.to_string(),
            self.name.clone(),
            self.ip_address.clone(),
            opt(&self.mac_address),
            opt(&self.os_name),
            self.device_type.clone(),
            opt(&self.manufacturer),
            self.location.name.clone(),
            self.location.latitude.clone(),
            self.location.longitude.clone(),
            opt(&self.serial),
            opt(&self.cpu_percent),
            opt(&self.battery_percent),
        ]
    }
}

/// Append-only CSV log of every host seen
pub struct DiscoveryArchive {
    path: PathBuf,
}

impl DiscoveryArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row per distinct IP address, keeping the first occurrence
    ///
    /// The header is written only when the file is missing or empty.
    /// Returns the number of rows written.
    pub fn append(&self, rows: &[ArchiveRow]) -> Result<usize> {
        let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let needs_header = std::fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);

        let mut out = String::new();
        if needs_header {
            out.push_str(&encode_line(HEADER.iter().copied()));
        }

        let mut seen = HashSet::new();
        let mut written = 0;
        for row in rows {
            if !seen.insert(row.ip_address.as_str()) {
                continue;
            }
            let fields = row.fields(&timestamp);
            out.push_str(&encode_line(fields.iter().map(String::as_str)));
            written += 1;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open discovery archive: {}", self.path.display()))?;
        file.write_all(out.as_bytes())
            .with_context(|| format!("Failed to append to discovery archive: {}", self.path.display()))?;

        tracing::info!("Appended {} record(s) to {}", written, self.path.display());
        Ok(written)
    }
}

fn encode_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(escape_field).collect::<Vec<_>>().join(",");
    line.push_str("\r\n");
    line
}

/// Quote a field when it contains a delimiter, quote or line break
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> LocationConfig {
        LocationConfig {
            name: "Chennai".to_string(),
            latitude: "13.0827".to_string(),
            longitude: "80.2707".to_string(),
        }
    }

    fn device(ip: [u8; 4], name: &str) -> ArchiveRow {
        ArchiveRow::device(
            &HostRecord {
                ip: Ipv4Addr::from(ip),
                mac: Some("aa:bb:cc:00:11:22".to_string()),
                hostname: name.to_string(),
            },
            &location(),
        )
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DiscoveryArchive::new(dir.path().join("network_discovery.csv"));

        archive.append(&[device([10, 0, 0, 9], "printer")]).unwrap();
        archive.append(&[device([10, 0, 0, 9], "printer")]).unwrap();

        let content = std::fs::read_to_string(archive.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,type,name,ipAddress"));
        assert_eq!(content.matches("timestamp,type").count(), 1);
    }

    #[test]
    fn one_row_per_ip_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DiscoveryArchive::new(dir.path().join("archive.csv"));

        let written = archive
            .append(&[
                device([10, 0, 0, 5], "me"),
                device([10, 0, 0, 5], "me-again"),
                device([10, 0, 0, 9], "printer"),
            ])
            .unwrap();

        assert_eq!(written, 2);
        let content = std::fs::read_to_string(archive.path()).unwrap();
        assert!(content.contains(",me,"));
        assert!(!content.contains("me-again"));
    }

    #[test]
    fn device_rows_leave_host_columns_blank() {
        let fields = device([10, 0, 0, 9], "printer").fields("T");
        assert_eq!(fields[1], "device");
        assert_eq!(fields[6], "Unknown");
        assert_eq!(&fields[11..], &["", "", ""]);
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        assert_eq!(escape_field("Chennai, TN"), "\"Chennai, TN\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("plain"), "plain");
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DiscoveryArchive::new(dir.path());
        assert!(archive.append(&[device([10, 0, 0, 9], "printer")]).is_err());
    }
}
