use anyhow::Result;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::common::{command_output, command_output_blocking};
use super::{INVENTORY_TIMEOUT, is_placeholder};
use crate::enforcement::FirewallRules;

const NETSH_TIMEOUT: Duration = Duration::from_secs(10);

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Windows Defender Firewall rules managed through `netsh advfirewall`
#[derive(Debug, Default)]
pub struct NetshFirewall;

impl FirewallRules for NetshFirewall {
    fn delete_rules(&self, rule_name: &str) -> Result<()> {
        // netsh exits non-zero when no rule matches, which is fine here
        command_output_blocking(
            "netsh",
            &[
                "advfirewall".to_string(),
                "firewall".to_string(),
                "delete".to_string(),
                "rule".to_string(),
                format!("name={}", rule_name),
            ],
            NETSH_TIMEOUT,
        )?;
        Ok(())
    }

    fn add_block_rule(&self, rule_name: &str, ip: Ipv4Addr) -> Result<()> {
        let status = command_output_blocking(
            "netsh",
            &[
                "advfirewall".to_string(),
                "firewall".to_string(),
                "add".to_string(),
                "rule".to_string(),
                format!("name={}", rule_name),
                "dir=out".to_string(),
                "action=block".to_string(),
                format!("remoteip={}", ip),
                "enable=yes".to_string(),
            ],
            NETSH_TIMEOUT,
        )?
        .status;

        if !status.success() {
            anyhow::bail!("netsh add rule for {} failed ({})", ip, status);
        }
        Ok(())
    }
}

/// Query the BIOS serial via CIM, falling back to `wmic`
pub async fn system_serial() -> Option<String> {
    let cim_queries = [
        "(Get-CimInstance Win32_BIOS).SerialNumber",
        "(Get-CimInstance Win32_ComputerSystemProduct).IdentifyingNumber",
    ];

    for query in cim_queries {
        if let Some(value) = powershell(query).await {
            return Some(value);
        }
    }

    wmic_value(&["bios", "get", "serialnumber"]).await
}

/// Query the system manufacturer via `wmic`
pub async fn system_manufacturer() -> String {
    wmic_value(&["computersystem", "get", "manufacturer"])
        .await
        .unwrap_or_else(|| "Unknown".to_string())
}

async fn powershell(query: &str) -> Option<String> {
    let output = command_output(
        "powershell",
        &args(&["-NoProfile", "-ExecutionPolicy", "Bypass", query]),
        INVENTORY_TIMEOUT,
    )
    .await
    .ok()?;

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if is_placeholder(&value) { None } else { Some(value) }
}

/// `wmic` prints a header line followed by the value
async fn wmic_value(wmic_args: &[&str]) -> Option<String> {
    let output = command_output("wmic", &args(wmic_args), INVENTORY_TIMEOUT)
        .await
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .nth(1)
        .map(str::to_string)
        .filter(|value| !is_placeholder(value))
}
