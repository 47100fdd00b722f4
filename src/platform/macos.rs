use super::common::command_output;
use super::{INVENTORY_TIMEOUT, is_placeholder};

/// Read the platform serial from the IOKit registry
pub async fn system_serial() -> Option<String> {
    let args = ["-d2", "-c", "IOPlatformExpertDevice"].map(String::from);
    let output = command_output("ioreg", &args, INVENTORY_TIMEOUT).await.ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ioreg_serial(&stdout)
}

/// Extract `IOPlatformSerialNumber` from `ioreg` output
fn parse_ioreg_serial(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("\"IOPlatformSerialNumber\""))
        .and_then(|line| line.split('"').nth(3))
        .map(str::to_string)
        .filter(|serial| !is_placeholder(serial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial_from_ioreg_line() {
        let output = r#"    | "IOPlatformUUID" = "0000-1111"
    | "IOPlatformSerialNumber" = "C02XK0ABJGH5"
"#;
        assert_eq!(parse_ioreg_serial(output), Some("C02XK0ABJGH5".to_string()));
    }

    #[test]
    fn missing_serial_yields_none() {
        assert_eq!(parse_ioreg_serial("no serial here"), None);
    }
}
