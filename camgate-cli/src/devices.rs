use camgate_core::types::{DeviceId, DeviceInfo};

pub const DEFAULT_DEVICES: &str = "0:50:flash,1:50:conflicts=2,2:50:conflicts=1";

// ─── Parsing Helpers ────────────────────────────────────────────────────────

/// Parses a comma-separated device list, each entry `id:cost[:flash][:conflicts=a|b]`.
pub fn parse_devices(list: &str) -> Result<Vec<DeviceInfo>, String> {
    let mut devices: Vec<DeviceInfo> = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let device = parse_device(entry)?;
        if devices.iter().any(|d| d.id == device.id) {
            return Err(format!("Duplicate device id '{}'", device.id));
        }
        devices.push(device);
    }
    if devices.is_empty() {
        return Err("At least one device is required".to_string());
    }
    Ok(devices)
}

fn parse_device(entry: &str) -> Result<DeviceInfo, String> {
    let mut parts = entry.split(':');
    let id = parts.next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err(format!("Missing device id in '{}'", entry));
    }
    let cost = parts
        .next()
        .ok_or_else(|| format!("Missing cost for device '{}'", id))?
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("Invalid cost for device '{}': {}", id, e))?;

    let mut device = DeviceInfo::new(id, cost);
    for option in parts.map(str::trim) {
        if option == "flash" {
            device = device.with_flash_unit();
        } else if let Some(ids) = option.strip_prefix("conflicts=") {
            let conflicts: Vec<DeviceId> = ids
                .split('|')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(DeviceId::from)
                .collect();
            if conflicts.iter().any(|c| c.as_str() == id) {
                return Err(format!("Device '{}' cannot conflict with itself", id));
            }
            device = device.with_conflicts(conflicts);
        } else {
            return Err(format!(
                "Unknown option '{}' for device '{}'. Use 'flash' or 'conflicts=a|b'",
                option, id
            ));
        }
    }
    Ok(device)
}
