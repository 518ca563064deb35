use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ArbiterError, Result};
use crate::types::{CompatParams, DeviceId, DeviceInfo, DeviceRecord, DeviceStatus};

/// Result of a status transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old: DeviceStatus,
    pub new: DeviceStatus,
    pub accepted: bool,
}

/// One device's mutable state. Records are never removed: a vanished device
/// is NOT_PRESENT so late callbacks referencing it stay harmless.
struct DeviceState {
    id: DeviceId,
    cost: u32,
    conflicting: BTreeSet<DeviceId>,
    has_flash_unit: bool,
    status: Mutex<DeviceStatus>,
    compat_params: Mutex<Option<CompatParams>>,
}

impl DeviceState {
    fn new(info: DeviceInfo) -> Self {
        Self {
            id: info.id,
            cost: info.resource_cost,
            conflicting: info.conflicting,
            has_flash_unit: info.has_flash_unit,
            status: Mutex::new(info.initial_status),
            compat_params: Mutex::new(None),
        }
    }

    fn status(&self) -> DeviceStatus {
        *self.status.lock()
    }

    /// Applies a guarded transition.
    ///
    /// `on_changed` runs with the status lock held, and only for accepted
    /// changes, so observers always see a consistent (old, new) pair.
    fn update_status<F>(&self, new: DeviceStatus, reject_sources: &[DeviceStatus], on_changed: F) -> Transition
    where
        F: FnOnce(&DeviceId, DeviceStatus, DeviceStatus),
    {
        let mut status = self.status.lock();
        let old = *status;
        let rejected = Transition {
            old,
            new,
            accepted: false,
        };

        if old == new {
            return rejected;
        }

        if old == DeviceStatus::NotPresent
            && !matches!(new, DeviceStatus::Present | DeviceStatus::Enumerating)
        {
            warn!(device = %self.id, to = %new, "From NOT_PRESENT can only transition into PRESENT or ENUMERATING");
            return rejected;
        }

        if reject_sources.contains(&old) {
            debug!(device = %self.id, from = %old, to = %new, "Rejecting status transition from a rejected source state");
            return rejected;
        }

        *status = new;
        debug!(device = %self.id, from = %old, to = %new, "Device status changed");

        if new == DeviceStatus::NotPresent {
            *self.compat_params.lock() = None;
        }

        on_changed(&self.id, old, new);

        Transition {
            old,
            new,
            accepted: true,
        }
    }

    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id.clone(),
            status: self.status(),
            resource_cost: self.cost,
            conflicting: self.conflicting.clone(),
            cached_compat_params: self.compat_params.lock().clone(),
            has_flash_unit: self.has_flash_unit,
        }
    }
}

/// One status state machine per known device.
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<DeviceId, Arc<DeviceState>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records a newly observed device. Returns false if the id is already known;
    /// an existing record is never replaced.
    pub fn register(&self, info: DeviceInfo) -> bool {
        let mut devices = self.devices.write();
        if devices.contains_key(&info.id) {
            return false;
        }
        devices.insert(info.id.clone(), Arc::new(DeviceState::new(info)));
        true
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.read().contains_key(id)
    }

    fn state(&self, id: &DeviceId) -> Result<Arc<DeviceState>> {
        self.devices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ArbiterError::UnknownDevice { device: id.clone() })
    }

    pub fn set_status(&self, id: &DeviceId, new: DeviceStatus) -> Result<Transition> {
        self.set_status_with(id, new, &[], |_, _, _| {})
    }

    /// Applies a guarded transition, rejecting it when the current status is one
    /// of `reject_sources`. `on_changed` runs under the device's status lock.
    pub fn set_status_with<F>(
        &self,
        id: &DeviceId,
        new: DeviceStatus,
        reject_sources: &[DeviceStatus],
        on_changed: F,
    ) -> Result<Transition>
    where
        F: FnOnce(&DeviceId, DeviceStatus, DeviceStatus),
    {
        // The map lock is released before the status lock is taken.
        let state = self.state(id)?;
        Ok(state.update_status(new, reject_sources, on_changed))
    }

    pub fn status(&self, id: &DeviceId) -> Result<DeviceStatus> {
        Ok(self.state(id)?.status())
    }

    /// Runs `f` with the device's current status while holding its status
    /// lock, so no transition can land until `f` returns. `f` may take the
    /// torch lock but must not take the table lock.
    pub fn with_status<R>(&self, id: &DeviceId, f: impl FnOnce(DeviceStatus) -> R) -> Result<R> {
        let state = self.state(id)?;
        let status = state.status.lock();
        Ok(f(*status))
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.read().get(id).map(|state| state.record())
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.snapshot().iter().map(|state| state.record()).collect()
    }

    pub fn statuses(&self) -> Vec<(DeviceId, DeviceStatus)> {
        self.snapshot()
            .iter()
            .map(|state| (state.id.clone(), state.status()))
            .collect()
    }

    pub fn set_cached_compat_params(&self, id: &DeviceId, params: CompatParams) -> Result<()> {
        let state = self.state(id)?;
        *state.compat_params.lock() = Some(params);
        Ok(())
    }

    pub fn cached_compat_params(&self, id: &DeviceId) -> Result<Option<CompatParams>> {
        let state = self.state(id)?;
        let cached = state.compat_params.lock().clone();
        Ok(cached)
    }

    fn snapshot(&self) -> Vec<Arc<DeviceState>> {
        self.devices.read().values().cloned().collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
