use async_trait::async_trait;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use crate::platform;

const ARP_TIMEOUT: Duration = Duration::from_secs(5);
const REVERSE_DNS_TIMEOUT: Duration = Duration::from_secs(5);

static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([0-9a-f]{2}[:-]){5}[0-9a-f]{2}\b").expect("valid MAC regex")
});

/// Name and hardware address lookups for discovered hosts
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Lowercase, colon-separated MAC from the ARP cache
    async fn mac_address(&self, ip: Ipv4Addr) -> Option<String>;

    /// Reverse-resolved name, or `device-<last octet>` when there is none
    async fn hostname(&self, ip: Ipv4Addr) -> String;
}

/// Resolver backed by the `arp` binary and the system resolver
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn mac_address(&self, ip: Ipv4Addr) -> Option<String> {
        let mut command = tokio::process::Command::new("arp");
        command
            .args(platform::arp_args(ip))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(ARP_TIMEOUT, command.output())
            .await
            .ok()?
            .ok()?;

        parse_mac(&String::from_utf8_lossy(&output.stdout))
    }

    async fn hostname(&self, ip: Ipv4Addr) -> String {
        let lookup = tokio::task::spawn_blocking(move || reverse_lookup(ip));
        let resolved = tokio::time::timeout(REVERSE_DNS_TIMEOUT, lookup)
            .await
            .ok()
            .and_then(Result::ok)
            .flatten();

        resolved.unwrap_or_else(|| fallback_name(ip))
    }
}

/// Extract the first MAC address from `arp` output
pub fn parse_mac(output: &str) -> Option<String> {
    MAC_PATTERN
        .find(output)
        .map(|m| m.as_str().replace('-', ":").to_lowercase())
}

pub fn fallback_name(ip: Ipv4Addr) -> String {
    format!("device-{}", ip.octets()[3])
}

fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    let name = dns_lookup::lookup_addr(&IpAddr::V4(ip)).ok()?;
    accept_reverse_name(ip, name)
}

/// Without a PTR record the resolver hands back the numeric address
fn accept_reverse_name(ip: Ipv4Addr, name: String) -> Option<String> {
    let name = name.trim_end_matches('.').to_string();
    if name.is_empty() || name == ip.to_string() {
        None
    } else {
        Some(name)
    }
}
