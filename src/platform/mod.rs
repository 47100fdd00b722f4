/// Common cross-platform utilities
pub mod common;

/// Windows-specific operations (netsh firewall, CIM inventory)
#[cfg(target_os = "windows")]
pub mod windows;

/// macOS-specific operations (ioreg inventory)
#[cfg(target_os = "macos")]
pub mod macos;

/// Linux-specific operations (DMI inventory)
#[cfg(target_os = "linux")]
pub mod linux;

pub use common::*;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on any single inventory lookup command
pub const INVENTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// System hosts file used by the hosts-file blocker
pub fn hosts_file_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    }

    #[cfg(not(target_os = "windows"))]
    {
        PathBuf::from("/etc/hosts")
    }
}

/// Default location of the optional agent configuration file
pub fn agent_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/itam-agent/agent.toml")
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Library/Application Support/itam-agent/agent.toml")
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("itam-agent");
        path.push("agent.toml");
        path
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from("agent.toml")
    }
}

/// Home directory of the account the agent runs under
pub fn home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Arguments for a single ICMP echo with the given timeout
pub fn ping_args(ip: Ipv4Addr, timeout: Duration) -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        vec![
            "-n".to_string(),
            "1".to_string(),
            "-w".to_string(),
            timeout.as_millis().to_string(),
            ip.to_string(),
        ]
    }

    #[cfg(target_os = "macos")]
    {
        // BSD ping: -W is the reply wait in milliseconds
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            timeout.as_millis().max(1).to_string(),
            ip.to_string(),
        ]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // iputils ping: -W takes whole seconds and 0 means no limit, so
        // clamp to 1 and rely on the outer timeout
        let secs = timeout.as_secs().max(1);
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            secs.to_string(),
            ip.to_string(),
        ]
    }
}

/// Arguments for an ARP cache lookup of one address
pub fn arp_args(ip: Ipv4Addr) -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        vec!["-a".to_string(), ip.to_string()]
    }

    #[cfg(not(target_os = "windows"))]
    {
        vec!["-n".to_string(), ip.to_string()]
    }
}

/// Human-readable device class reported for the local host
pub fn device_type() -> &'static str {
    if cfg!(target_os = "macos") {
        "Mac"
    } else if cfg!(target_os = "windows") {
        "PC"
    } else {
        "Linux Machine"
    }
}

/// Best-effort hardware serial number
pub async fn system_serial() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        linux::system_serial().await
    }

    #[cfg(target_os = "macos")]
    {
        macos::system_serial().await
    }

    #[cfg(target_os = "windows")]
    {
        windows::system_serial().await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

/// Best-effort hardware manufacturer, `Unknown` when undeterminable
pub async fn system_manufacturer() -> String {
    #[cfg(target_os = "linux")]
    {
        linux::system_manufacturer().await
    }

    #[cfg(target_os = "macos")]
    {
        "Apple".to_string()
    }

    #[cfg(target_os = "windows")]
    {
        windows::system_manufacturer().await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        "Unknown".to_string()
    }
}

/// Vendor placeholder strings that firmware ships instead of a real value
pub(crate) fn is_placeholder(value: &str) -> bool {
    let lower = value.trim().to_lowercase();
    lower.is_empty()
        || lower == "none"
        || lower == "unknown"
        || lower == "to be filled by o.e.m."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_args_target_the_address_last() {
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        let args = ping_args(ip, Duration::from_millis(500));
        assert_eq!(args.last().map(String::as_str), Some("10.0.0.9"));
        assert!(args.contains(&"1".to_string()));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn macos_ping_wait_is_in_milliseconds() {
        let args = ping_args(Ipv4Addr::new(10, 0, 0, 1), Duration::from_millis(500));
        let pos = args.iter().position(|a| a == "-W").unwrap();
        assert_eq!(args[pos + 1], "500");
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    #[test]
    fn ping_timeout_never_rounds_to_zero() {
        let args = ping_args(Ipv4Addr::new(10, 0, 0, 1), Duration::from_millis(500));
        let pos = args.iter().position(|a| a == "-W").unwrap();
        assert_eq!(args[pos + 1], "1");
    }

    #[test]
    fn placeholder_values_are_recognised() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("  None "));
        assert!(is_placeholder("To Be Filled By O.E.M."));
        assert!(!is_placeholder("PF2ABCDE"));
    }
}
