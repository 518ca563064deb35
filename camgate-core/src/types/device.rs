use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable identifier of a device, assigned by the hardware module at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Presence/availability of a device.
///
/// `NotAvailable` is never reported by hardware: it means "present but held
/// by a client" and is derived from session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    NotPresent,
    Present,
    Enumerating,
    NotAvailable,
    Unknown,
}

impl DeviceStatus {
    /// Maps a raw hardware status code. Hardware only reports the first three states.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DeviceStatus::NotPresent),
            1 => Some(DeviceStatus::Present),
            2 => Some(DeviceStatus::Enumerating),
            _ => None,
        }
    }

    /// Status code handed to listeners and remote callers.
    pub fn to_interface(self) -> i32 {
        match self {
            DeviceStatus::NotPresent => 0,
            DeviceStatus::Present => 1,
            DeviceStatus::Enumerating => 2,
            DeviceStatus::NotAvailable => -2,
            DeviceStatus::Unknown => -1,
        }
    }

    /// Whether a client may be admitted to a device in this status.
    /// A held device is still usable: its holder can be evicted.
    pub fn is_usable(self) -> bool {
        matches!(self, DeviceStatus::Present | DeviceStatus::NotAvailable)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::NotPresent => write!(f, "NOT_PRESENT"),
            DeviceStatus::Present => write!(f, "PRESENT"),
            DeviceStatus::Enumerating => write!(f, "ENUMERATING"),
            DeviceStatus::NotAvailable => write!(f, "NOT_AVAILABLE"),
            DeviceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Status of the torch (flash unit) attached to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TorchStatus {
    NotAvailable,
    AvailableOff,
    AvailableOn,
}

impl TorchStatus {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(TorchStatus::NotAvailable),
            1 => Some(TorchStatus::AvailableOff),
            2 => Some(TorchStatus::AvailableOn),
            _ => None,
        }
    }

    pub fn to_interface(self) -> i32 {
        match self {
            TorchStatus::NotAvailable => 0,
            TorchStatus::AvailableOff => 1,
            TorchStatus::AvailableOn => 2,
        }
    }

    /// The torch status implied by a device status transition, used to keep
    /// the torch in step with its camera.
    pub fn for_device(status: DeviceStatus) -> Self {
        if status == DeviceStatus::Present {
            TorchStatus::AvailableOff
        } else {
            TorchStatus::NotAvailable
        }
    }

    /// Whether this torch status may coexist with the given device status.
    pub fn permitted_with(self, status: DeviceStatus) -> bool {
        match self {
            TorchStatus::NotAvailable => true,
            TorchStatus::AvailableOff => status.is_usable(),
            TorchStatus::AvailableOn => status == DeviceStatus::Present,
        }
    }
}

impl std::fmt::Display for TorchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorchStatus::NotAvailable => write!(f, "NOT_AVAILABLE"),
            TorchStatus::AvailableOff => write!(f, "AVAILABLE_OFF"),
            TorchStatus::AvailableOn => write!(f, "AVAILABLE_ON"),
        }
    }
}

/// Legacy compatibility parameters, cached per device so the hardware module
/// is queried once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatParams(String);

impl CompatParams {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Static description of a device as reported by the hardware module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Share of the aggregate cost budget an open session consumes.
    pub resource_cost: u32,
    /// Devices that cannot be open at the same time as this one.
    pub conflicting: BTreeSet<DeviceId>,
    pub has_flash_unit: bool,
    pub initial_status: DeviceStatus,
}

impl DeviceInfo {
    pub fn new(id: impl Into<DeviceId>, resource_cost: u32) -> Self {
        Self {
            id: id.into(),
            resource_cost,
            conflicting: BTreeSet::new(),
            has_flash_unit: false,
            initial_status: DeviceStatus::Present,
        }
    }

    pub fn with_conflicts<I, D>(mut self, conflicting: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        self.conflicting = conflicting.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flash_unit(mut self) -> Self {
        self.has_flash_unit = true;
        self
    }

    pub fn with_initial_status(mut self, status: DeviceStatus) -> Self {
        self.initial_status = status;
        self
    }
}

/// Immutable snapshot of a device's registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub status: DeviceStatus,
    pub resource_cost: u32,
    pub conflicting: BTreeSet<DeviceId>,
    pub cached_compat_params: Option<CompatParams>,
    pub has_flash_unit: bool,
}
