use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::{ArbiterError, BusyReason, Result};
use crate::events::{EventFanout, StatusListener};
use crate::infrastructure::UsageObserver;
use crate::types::{DeviceId, DeviceStatus, Pid, TorchStatus};

#[derive(Debug, Clone)]
struct TorchSlot {
    status: TorchStatus,
    /// Process that last asked for a change and is awaiting confirmation.
    pending_owner: Option<Pid>,
    /// Process the current status is attributed to.
    current_owner: Option<Pid>,
    /// Process holding the torch on, cleaned up if it dies.
    enabled_by: Option<Pid>,
}

/// Read-only view of one torch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorchInfo {
    pub device: DeviceId,
    pub status: TorchStatus,
    pub owner: Option<Pid>,
}

/// Torch status per flash-equipped device, with owner accounting.
///
/// The tracker's lock may be taken while a device's status lock is held,
/// never the other way around.
pub struct TorchTracker {
    slots: Mutex<BTreeMap<DeviceId, TorchSlot>>,
}

impl TorchTracker {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, device: DeviceId, status: TorchStatus) {
        self.slots.lock().entry(device).or_insert(TorchSlot {
            status,
            pending_owner: None,
            current_owner: None,
            enabled_by: None,
        });
    }

    pub fn status(&self, device: &DeviceId) -> Option<TorchStatus> {
        self.slots.lock().get(device).map(|slot| slot.status)
    }

    pub fn infos(&self) -> Vec<TorchInfo> {
        self.slots
            .lock()
            .iter()
            .map(|(device, slot)| TorchInfo {
                device: device.clone(),
                status: slot.status,
                owner: slot.enabled_by,
            })
            .collect()
    }

    /// Replays every torch status to a single listener.
    pub fn replay(&self, listener: &dyn StatusListener) {
        let slots = self.slots.lock();
        for (device, slot) in slots.iter() {
            listener.on_torch_status_changed(device, slot.status);
        }
    }

    /// Checks whether a torch request may proceed given its camera's status.
    pub fn check_available(&self, device: &DeviceId, camera: DeviceStatus) -> Result<()> {
        let slots = self.slots.lock();
        let slot = slots.get(device).ok_or_else(|| {
            ArbiterError::illegal(format!("device \"{device}\" does not have a flash unit"))
        })?;

        if slot.status == TorchStatus::NotAvailable {
            let reason = if camera == DeviceStatus::NotAvailable {
                BusyReason::CameraInUse
            } else {
                BusyReason::InsufficientResources
            };
            warn!(device = %device, %reason, "Torch mode is not available");
            return Err(ArbiterError::Busy {
                device: device.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Records who asked for the next change, for accounting when it lands.
    pub fn set_pending_owner(&self, device: &DeviceId, pid: Pid) {
        if let Some(slot) = self.slots.lock().get_mut(device) {
            slot.pending_owner = Some(pid);
            if slot.current_owner.is_none() {
                slot.current_owner = Some(pid);
            }
        }
    }

    /// Tracks the process holding the torch on so its death can switch it off.
    pub fn track_enabled(&self, device: &DeviceId, pid: Pid, enabled: bool) {
        if let Some(slot) = self.slots.lock().get_mut(device) {
            slot.enabled_by = if enabled { Some(pid) } else { None };
        }
    }

    pub fn enabled_by(&self, pid: Pid) -> Vec<DeviceId> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.enabled_by == Some(pid))
            .map(|(device, _)| device.clone())
            .collect()
    }

    /// Forces the torch in step with an accepted device transition. Devices
    /// without a flash unit are skipped.
    pub fn sync_with_device(
        &self,
        device: &DeviceId,
        camera: DeviceStatus,
        fanout: &EventFanout,
        usage: &dyn UsageObserver,
    ) {
        if self.status(device).is_some() {
            self.apply(device, TorchStatus::for_device(camera), fanout, usage);
        }
    }

    /// Applies a confirmed status. Accounting and fan-out happen under the
    /// tracker's lock. Returns whether the status changed.
    pub fn apply(
        &self,
        device: &DeviceId,
        new: TorchStatus,
        fanout: &EventFanout,
        usage: &dyn UsageObserver,
    ) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(device) else {
            warn!(device = %device, "Torch status for a device without a flash unit");
            return false;
        };
        let old = slot.status;
        if old == new {
            return false;
        }
        slot.status = new;
        info!(device = %device, from = %old, to = %new, "Torch status changed");

        if new != TorchStatus::AvailableOn {
            slot.enabled_by = None;
        }

        if let (Some(pending), Some(current)) = (slot.pending_owner, slot.current_owner) {
            if pending != current {
                if old == TorchStatus::AvailableOn {
                    usage.torch_off(device, current);
                }
                if new == TorchStatus::AvailableOn {
                    usage.torch_on(device, pending);
                }
                slot.current_owner = Some(pending);
            } else if new == TorchStatus::AvailableOn {
                usage.torch_on(device, current);
            } else {
                usage.torch_off(device, current);
            }
        }

        fanout.notify_torch_status_changed(device, new);
        true
    }
}

impl Default for TorchTracker {
    fn default() -> Self {
        Self::new()
    }
}
