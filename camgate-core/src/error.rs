//! Error types for the arbitration engine.
//!
//! [`ArbiterError`] is what every fallible engine operation returns.
//! [`HardwareError`] is what the hardware module collaborator reports and is
//! wrapped by [`ArbiterError::Hardware`].

use std::time::Duration;
use thiserror::Error;

use crate::types::{DeviceId, DeviceStatus, Pid};

/// Why a request could not be served right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyReason {
    /// Another admission held the gate for longer than the connect timeout.
    TooManyConnecting,
    /// Conflicting clients with higher priority hold the device.
    HigherPriority { blockers: Vec<Pid> },
    /// The aggregate cost budget cannot be met without evicting higher-priority clients.
    OverBudget { blockers: Vec<Pid> },
    /// The torch cannot be used while its camera is open.
    CameraInUse,
    /// The torch is unavailable for lack of resources.
    InsufficientResources,
}

impl std::fmt::Display for BusyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyReason::TooManyConnecting => write!(f, "too many other clients connecting"),
            BusyReason::HigherPriority { blockers } => {
                write!(f, "held by higher-priority client(s) {blockers:?}")
            }
            BusyReason::OverBudget { blockers } => {
                write!(f, "resource budget held by higher-priority client(s) {blockers:?}")
            }
            BusyReason::CameraInUse => write!(f, "an existing camera user holds the device"),
            BusyReason::InsufficientResources => write!(f, "insufficient resources"),
        }
    }
}

/// Errors returned by the engine.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    /// The device id was never enumerated. Indicates a caller or driver bug.
    #[error("unknown device \"{device}\"")]
    UnknownDevice { device: DeviceId },

    /// The device is not present or still enumerating.
    #[error("device \"{device}\" is not available (status {status})")]
    DeviceUnavailable {
        device: DeviceId,
        status: DeviceStatus,
    },

    #[error("caller pid {pid} may not open device \"{device}\": {reason}")]
    NotAuthorized {
        device: DeviceId,
        pid: Pid,
        reason: String,
    },

    /// Contention could not be resolved; nothing was admitted or evicted.
    #[error("device \"{device}\" is busy: {reason}")]
    Busy { device: DeviceId, reason: BusyReason },

    /// Evicted clients did not finish teardown within the wait budget.
    #[error("timed out after {timeout:?} waiting for {pending} client(s) of device \"{device}\" to disconnect")]
    TimedOut {
        device: DeviceId,
        timeout: Duration,
        pending: usize,
    },

    /// A broken removal/eviction invariant. Never repaired silently.
    #[error("internal inconsistency: {detail}")]
    InternalInconsistency { detail: String },

    #[error("illegal argument: {detail}")]
    IllegalArgument { detail: String },

    #[error("priority query failed: {0}")]
    PriorityQuery(String),

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl ArbiterError {
    /// Returns a short stable label (snake_case) for use in logs and responses.
    pub fn as_label(&self) -> &'static str {
        match self {
            ArbiterError::UnknownDevice { .. } => "unknown_device",
            ArbiterError::DeviceUnavailable { .. } => "device_unavailable",
            ArbiterError::NotAuthorized { .. } => "not_authorized",
            ArbiterError::Busy { .. } => "busy",
            ArbiterError::TimedOut { .. } => "timed_out",
            ArbiterError::InternalInconsistency { .. } => "internal_inconsistency",
            ArbiterError::IllegalArgument { .. } => "illegal_argument",
            ArbiterError::PriorityQuery(_) => "priority_query",
            ArbiterError::Hardware(_) => "hardware",
        }
    }

    /// Validation failures are returned before any eviction could happen.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ArbiterError::UnknownDevice { .. }
                | ArbiterError::DeviceUnavailable { .. }
                | ArbiterError::NotAuthorized { .. }
                | ArbiterError::IllegalArgument { .. }
        )
    }

    pub(crate) fn illegal(detail: impl Into<String>) -> Self {
        ArbiterError::IllegalArgument {
            detail: detail.into(),
        }
    }

    pub(crate) fn inconsistency(detail: impl Into<String>) -> Self {
        ArbiterError::InternalInconsistency {
            detail: detail.into(),
        }
    }
}

/// Failures reported by the hardware module.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("no such device \"{0}\"")]
    NoDevice(DeviceId),

    #[error("device \"{0}\" is already open")]
    InUse(DeviceId),

    #[error("device \"{0}\" has no flash unit")]
    NoFlashUnit(DeviceId),

    #[error("hardware failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, ArbiterError>;
