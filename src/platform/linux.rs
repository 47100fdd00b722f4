use std::path::Path;

use super::common::command_output;
use super::{INVENTORY_TIMEOUT, is_placeholder};

/// DMI files checked in order for a serial number
const SERIAL_PATHS: &[&str] = &[
    "/sys/class/dmi/id/product_serial",
    "/sys/devices/virtual/dmi/id/product_serial",
    "/sys/class/dmi/id/board_serial",
    "/sys/class/dmi/id/product_uuid",
];

const VENDOR_PATH: &str = "/sys/class/dmi/id/sys_vendor";

/// Read the hardware serial from DMI, falling back to `dmidecode`
///
/// Most DMI serial files are root-only; unreadable ones are skipped.
pub async fn system_serial() -> Option<String> {
    match SERIAL_PATHS.iter().find_map(|p| read_dmi_value(Path::new(p))) {
        Some(serial) => Some(serial),
        None => dmidecode("system-serial-number").await,
    }
}

/// Read the system vendor from DMI, falling back to `dmidecode`
pub async fn system_manufacturer() -> String {
    let vendor = match read_dmi_value(Path::new(VENDOR_PATH)) {
        Some(vendor) => Some(vendor),
        None => dmidecode("system-manufacturer").await,
    };
    vendor.unwrap_or_else(|| "Unknown".to_string())
}

fn read_dmi_value(path: &Path) -> Option<String> {
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    if is_placeholder(value) {
        None
    } else {
        Some(value.to_string())
    }
}

async fn dmidecode(keyword: &str) -> Option<String> {
    let args = ["-s".to_string(), keyword.to_string()];
    let output = command_output("dmidecode", &args, INVENTORY_TIMEOUT).await.ok()?;
    if !output.status.success() {
        return None;
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if is_placeholder(&value) { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_dmi_value_trims_and_rejects_placeholders() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("product_serial");
        let filler = dir.path().join("board_serial");
        std::fs::write(&good, "PF2ABCDE\n").unwrap();
        std::fs::write(&filler, "To be filled by O.E.M.\n").unwrap();

        assert_eq!(read_dmi_value(&good), Some("PF2ABCDE".to_string()));
        assert_eq!(read_dmi_value(&filler), None);
        assert_eq!(read_dmi_value(&dir.path().join("missing")), None);
    }
}
