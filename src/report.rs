use chrono::Local;
use serde::Serialize;
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::agent::LocationConfig;
use crate::cache::{DeliveryCache, DeviceKey};
use crate::inventory::{HealthSnapshot, HostInventory};
use crate::malware::Finding;
use crate::transport::Transport;

/// A responsive host found by the sweep, after name and MAC resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub hostname: String,
}

/// Record submitted to the backend's device endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub model: String,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub status: String,
    pub location: String,
    pub latitude: String,
    pub longitude: String,
    pub discovery_method: String,
    /// JSON document encoded as a string, as the backend expects
    pub discovery_data: String,
}

impl OutboundRecord {
    /// Names of required fields that are empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("type", &self.record_type),
            ("ipAddress", &self.ip_address),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect()
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(&self.name, &self.ip_address)
    }

    /// Pretty JSON with `discoveryData` expanded for readability
    fn pretty(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => return format!("(could not render record: {})", e),
        };
        if let Ok(inner) = serde_json::from_str::<serde_json::Value>(&self.discovery_data) {
            value["discoveryData"] = inner;
        }
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

/// Facts shared by every record built in one cycle
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub agent_name: String,
    pub account: String,
    pub agent_serial: Option<String>,
    pub location: LocationConfig,
    pub health: HealthSnapshot,
}

impl RecordContext {
    pub fn new(
        inventory: &HostInventory,
        account: &str,
        location: &LocationConfig,
        health: HealthSnapshot,
    ) -> Self {
        Self {
            agent_name: inventory.agent_name.clone(),
            account: account.to_string(),
            agent_serial: inventory.serial.clone(),
            location: location.clone(),
            health,
        }
    }
}

fn scan_time() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Record for a remote device discovered by the sweep
pub fn device_record(host: &HostRecord, ctx: &RecordContext) -> OutboundRecord {
    let discovery = json!({
        "agent_name": ctx.agent_name,
        "scan_time": scan_time(),
        "source": "PING",
        "account": ctx.account,
        "agent_serial": ctx.agent_serial,
        "cpu_percent": ctx.health.cpu_percent,
        "ram_percent": ctx.health.ram_percent,
        "battery_percent": ctx.health.battery_percent,
        "nmap_seen": false,
    });

    OutboundRecord {
        name: host.hostname.clone(),
        record_type: "Workstation".to_string(),
        model: "Unknown".to_string(),
        ip_address: host.ip.to_string(),
        mac_address: host.mac.clone(),
        status: "Active".to_string(),
        location: ctx.location.name.clone(),
        latitude: ctx.location.latitude.clone(),
        longitude: ctx.location.longitude.clone(),
        discovery_method: "Agent Discovery".to_string(),
        discovery_data: discovery.to_string(),
    }
}

/// Per-cycle security notification describing the local host
pub fn security_record(
    local_ip: Option<Ipv4Addr>,
    local_mac: Option<String>,
    findings: &[Finding],
    ctx: &RecordContext,
) -> OutboundRecord {
    let status = if findings.is_empty() { "safe" } else { "infected" };
    let discovery = json!({
        "agent_name": ctx.agent_name,
        "scan_time": scan_time(),
        "malware_status": status,
        "malware_findings": findings,
        "agent_serial": ctx.agent_serial,
        "cpu_percent": ctx.health.cpu_percent,
        "ram_percent": ctx.health.ram_percent,
        "battery_percent": ctx.health.battery_percent,
    });

    OutboundRecord {
        name: format!(
            "{}-security-{}",
            ctx.agent_name,
            Local::now().format("%Y%m%d%H%M%S")
        ),
        record_type: "Workstation".to_string(),
        model: "SecurityNotification".to_string(),
        ip_address: local_ip.unwrap_or(Ipv4Addr::LOCALHOST).to_string(),
        mac_address: local_mac,
        status: "Active".to_string(),
        location: ctx.location.name.clone(),
        latitude: ctx.location.latitude.clone(),
        longitude: ctx.location.longitude.clone(),
        discovery_method: "Agent Security Scan".to_string(),
        discovery_data: discovery.to_string(),
    }
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(u16),
    /// Already delivered within the retention window; nothing was sent
    Duplicate,
    /// Required fields missing; never sent
    Rejected(Vec<&'static str>),
    Failed,
}

/// Totals for one batch of device records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub sent: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl ReportSummary {
    fn record(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Sent(_) => self.sent += 1,
            Delivery::Duplicate => self.duplicates += 1,
            Delivery::Rejected(_) => self.rejected += 1,
            Delivery::Failed => self.failed += 1,
        }
    }
}

/// Sends records to the backend, suppressing devices already delivered
///
/// There is no retry within a cycle: a failed device record is simply not
/// marked as sent, so the next cycle picks it up again.
pub struct ReportingPipeline {
    transport: Arc<dyn Transport>,
    cache: DeliveryCache,
    send_delay: Duration,
}

impl ReportingPipeline {
    pub fn new(transport: Arc<dyn Transport>, cache: DeliveryCache, send_delay: Duration) -> Self {
        Self {
            transport,
            cache,
            send_delay,
        }
    }

    pub fn cache(&self) -> &DeliveryCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut DeliveryCache {
        &mut self.cache
    }

    /// Send the security notification; never deduplicated
    pub async fn send_security_notification(&mut self, record: &OutboundRecord) -> Delivery {
        debug!("Security notification (pre-send):\n{}", record.pretty());

        let missing = record.missing_fields();
        if !missing.is_empty() {
            error!("Security notification missing required fields: {}", missing.join(", "));
            return Delivery::Rejected(missing);
        }

        self.post(record).await
    }

    /// Build and send a record for every host except `local_ip`
    pub async fn report_devices(
        &mut self,
        hosts: &[HostRecord],
        local_ip: Ipv4Addr,
        ctx: &RecordContext,
    ) -> ReportSummary {
        let mut summary = ReportSummary::default();
        let mut first_send = true;

        for host in hosts.iter().filter(|host| host.ip != local_ip) {
            let record = device_record(host, ctx);
            debug!("Device record (pre-send):\n{}", record.pretty());

            let missing = record.missing_fields();
            if !missing.is_empty() {
                error!("Device record missing required fields: {}", missing.join(", "));
                summary.record(&Delivery::Rejected(missing));
                continue;
            }

            let key = record.device_key();
            if self.cache.already_sent(&key) {
                info!("[DUPLICATE] {} ({}) skipped", record.name, record.ip_address);
                summary.record(&Delivery::Duplicate);
                continue;
            }

            if !first_send && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            first_send = false;

            let delivery = self.post(&record).await;
            if matches!(delivery, Delivery::Sent(_)) {
                if let Err(e) = self.cache.mark_sent(key) {
                    warn!("Delivered {} but could not persist delivery cache: {:#}", record.name, e);
                }
            }
            summary.record(&delivery);
        }

        summary
    }

    async fn post(&self, record: &OutboundRecord) -> Delivery {
        match self.transport.post_record(record).await {
            Ok(status) => {
                info!("SENT {} ({}) HTTP {}", record.name, record.ip_address, status);
                Delivery::Sent(status)
            }
            Err(e) => {
                error!("FAILED {} ({}): {}", record.name, record.ip_address, e);
                Delivery::Failed
            }
        }
    }
}
