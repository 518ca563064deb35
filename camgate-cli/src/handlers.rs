use serde::{Deserialize, Serialize};

use camgate_core::types::{ClientKind, DeviceInfo, DeviceStatus, Priority, TorchStatus};

// ─── Validation Constants ───────────────────────────────────────────────────

const VALID_KINDS: &[&str] = &["legacy", "modern"];

const VALID_DEVICE_STATUSES: &[&str] = &["NOT_PRESENT", "PRESENT", "ENUMERATING"];

const VALID_TORCH_STATUSES: &[&str] = &["NOT_AVAILABLE", "AVAILABLE_OFF", "AVAILABLE_ON"];

// ─── Validation Helpers ─────────────────────────────────────────────────────

pub fn parse_kind(kind: Option<&str>) -> Result<ClientKind, String> {
    match kind.map(str::to_lowercase).as_deref() {
        None | Some("modern") => Ok(ClientKind::Modern),
        Some("legacy") => Ok(ClientKind::Legacy),
        Some(other) => Err(format!(
            "Invalid kind '{}'. Must be one of: {}",
            other,
            VALID_KINDS.join(", ")
        )),
    }
}

/// Hardware only ever reports the first three device states.
pub fn parse_device_status(status: &str) -> Result<DeviceStatus, String> {
    match status.to_uppercase().as_str() {
        "NOT_PRESENT" => Ok(DeviceStatus::NotPresent),
        "PRESENT" => Ok(DeviceStatus::Present),
        "ENUMERATING" => Ok(DeviceStatus::Enumerating),
        _ => Err(format!(
            "Invalid status '{}'. Must be one of: {}",
            status,
            VALID_DEVICE_STATUSES.join(", ")
        )),
    }
}

pub fn parse_torch_status(status: &str) -> Result<TorchStatus, String> {
    match status.to_uppercase().as_str() {
        "NOT_AVAILABLE" => Ok(TorchStatus::NotAvailable),
        "AVAILABLE_OFF" => Ok(TorchStatus::AvailableOff),
        "AVAILABLE_ON" => Ok(TorchStatus::AvailableOn),
        _ => Err(format!(
            "Invalid torch status '{}'. Must be one of: {}",
            status,
            VALID_TORCH_STATUSES.join(", ")
        )),
    }
}

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterProcessRequest {
    pub pid: i32,
    pub score: i32,
    pub state: i32,
}

impl RegisterProcessRequest {
    pub fn priority(&self) -> Priority {
        Priority::new(self.score, self.state)
    }
}

#[derive(Deserialize)]
pub struct ConnectDeviceRequest {
    pub device_id: String,
    pub pid: i32,
    pub uid: u32,
    pub package: String,
    pub kind: Option<String>,
    /// Transport endpoint of the caller; defaults to one per pid.
    pub endpoint: Option<String>,
    /// Overrides the per-client teardown wait for this connect.
    pub wait_ms: Option<u64>,
}

impl ConnectDeviceRequest {
    pub fn validate(&self) -> Result<ClientKind, String> {
        if self.device_id.is_empty() {
            return Err("device_id is required".to_string());
        }
        if self.package.is_empty() {
            return Err("package is required".to_string());
        }
        if self.pid <= 0 {
            return Err("pid must be greater than 0".to_string());
        }
        if matches!(self.endpoint.as_deref(), Some("")) {
            return Err("endpoint must not be empty".to_string());
        }
        parse_kind(self.kind.as_deref())
    }
}

#[derive(Deserialize)]
pub struct TorchRequest {
    pub device_id: String,
    pub pid: i32,
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct SwitchUsersRequest {
    pub user_ids: Vec<i32>,
}

#[derive(Deserialize)]
pub struct AddDeviceRequest {
    pub id: String,
    pub cost: u32,
    #[serde(default)]
    pub flash: bool,
    #[serde(default)]
    pub conflicts: Vec<String>,
}

impl AddDeviceRequest {
    pub fn validate(&self) -> Result<DeviceInfo, String> {
        if self.id.is_empty() {
            return Err("id is required".to_string());
        }
        if self.conflicts.iter().any(|c| c == &self.id) {
            return Err(format!("Device '{}' cannot conflict with itself", self.id));
        }
        // Plugged-in devices enumerate as absent until the PRESENT callback.
        let mut info = DeviceInfo::new(self.id.as_str(), self.cost)
            .with_conflicts(self.conflicts.iter().map(String::as_str))
            .with_initial_status(DeviceStatus::NotPresent);
        if self.flash {
            info = info.with_flash_unit();
        }
        Ok(info)
    }
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error label, set when `error` comes from the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub devices: usize,
    pub active_clients: usize,
    pub version: String,
}

#[derive(Serialize)]
pub struct DeviceStatusInfo {
    pub id: String,
    pub status: DeviceStatus,
    pub status_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torch: Option<TorchStatus>,
}

#[derive(Serialize)]
pub struct TransitionResponse {
    pub device_id: String,
    pub old: DeviceStatus,
    pub new: DeviceStatus,
    pub accepted: bool,
}

#[derive(Serialize)]
pub struct DisconnectedResponse {
    pub disconnected: usize,
}
