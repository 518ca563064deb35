use crate::error::HardwareError;
use crate::infrastructure::{HardwareModule, HardwareSession, PriorityOracle};
use crate::types::{CompatParams, DeviceId, DeviceInfo, Pid, Priority};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Simulated driver layer. Devices are plain records, sessions are counters,
/// and session teardown can be held open to simulate a slow close.
pub struct InMemoryHardware {
    // Map of Device ID -> static info
    devices: RwLock<BTreeMap<DeviceId, DeviceInfo>>,
    // Map of hardware session ID -> device
    open: Mutex<HashMap<u64, DeviceId>>,
    next_session: AtomicU64,
    closed: AtomicUsize,
    hold_closes: Mutex<bool>,
    closes_released: Condvar,
    fail_next_open: AtomicBool,
    torch_requests: Mutex<Vec<(DeviceId, bool)>>,
    legacy_queries: AtomicUsize,
}

impl InMemoryHardware {
    pub fn new(devices: impl IntoIterator<Item = DeviceInfo>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().map(|d| (d.id.clone(), d)).collect()),
            open: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            closed: AtomicUsize::new(0),
            hold_closes: Mutex::new(false),
            closes_released: Condvar::new(),
            fail_next_open: AtomicBool::new(false),
            torch_requests: Mutex::new(Vec::new()),
            legacy_queries: AtomicUsize::new(0),
        }
    }

    /// Makes a device known to the driver, as if it were just plugged in.
    pub fn add_device(&self, info: DeviceInfo) {
        self.devices.write().insert(info.id.clone(), info);
    }

    /// Blocks every `close_session` until [`InMemoryHardware::release_closes`].
    pub fn hold_closes(&self) {
        *self.hold_closes.lock() = true;
    }

    pub fn release_closes(&self) {
        *self.hold_closes.lock() = false;
        self.closes_released.notify_all();
    }

    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    pub fn open_sessions(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_open(&self, id: &DeviceId) -> bool {
        self.open.lock().values().any(|d| d == id)
    }

    pub fn closed_sessions(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn torch_requests(&self) -> Vec<(DeviceId, bool)> {
        self.torch_requests.lock().clone()
    }

    pub fn legacy_queries(&self) -> usize {
        self.legacy_queries.load(Ordering::SeqCst)
    }

    fn info(&self, id: &DeviceId) -> Result<DeviceInfo, HardwareError> {
        self.devices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| HardwareError::NoDevice(id.clone()))
    }
}

impl HardwareModule for InMemoryHardware {
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().values().cloned().collect()
    }

    fn device_info(&self, id: &DeviceId) -> Result<DeviceInfo, HardwareError> {
        self.info(id)
    }

    fn open_session(&self, id: &DeviceId) -> Result<HardwareSession, HardwareError> {
        self.info(id)?;
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(HardwareError::Failure(format!("simulated open failure on {id}")));
        }
        let mut open = self.open.lock();
        if open.values().any(|d| d == id) {
            return Err(HardwareError::InUse(id.clone()));
        }
        let session = HardwareSession {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            device_id: id.clone(),
        };
        open.insert(session.id, id.clone());
        Ok(session)
    }

    fn close_session(&self, session: &HardwareSession) {
        {
            let mut held = self.hold_closes.lock();
            while *held {
                self.closes_released.wait(&mut held);
            }
        }
        if self.open.lock().remove(&session.id).is_some() {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set_torch_mode(&self, id: &DeviceId, enabled: bool) -> Result<(), HardwareError> {
        if !self.info(id)?.has_flash_unit {
            return Err(HardwareError::NoFlashUnit(id.clone()));
        }
        self.torch_requests.lock().push((id.clone(), enabled));
        Ok(())
    }

    fn legacy_parameters(&self, id: &DeviceId) -> Result<CompatParams, HardwareError> {
        self.info(id)?;
        self.legacy_queries.fetch_add(1, Ordering::SeqCst);
        Ok(CompatParams::new(format!("legacy-params:{id}")))
    }
}

/// Priority table filled in by hand. Unknown processes get [`Priority::LOWEST`].
pub struct InMemoryPriorityOracle {
    // Map of PID -> Priority
    priorities: RwLock<HashMap<Pid, Priority>>,
    failing: AtomicBool,
}

impl InMemoryPriorityOracle {
    pub fn new() -> Self {
        Self {
            priorities: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn register_process(&self, pid: Pid, priority: Priority) {
        self.priorities.write().insert(pid, priority);
    }

    pub fn forget_process(&self, pid: Pid) {
        self.priorities.write().remove(&pid);
    }

    pub fn get_priorities(&self) -> HashMap<Pid, Priority> {
        self.priorities.read().clone()
    }

    /// Makes every query fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for InMemoryPriorityOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityOracle for InMemoryPriorityOracle {
    fn process_priorities(&self, pids: &[Pid]) -> Result<Vec<Priority>, String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("priority source unavailable".to_string());
        }
        let priorities = self.priorities.read();
        Ok(pids
            .iter()
            .map(|pid| priorities.get(pid).copied().unwrap_or(Priority::LOWEST))
            .collect())
    }
}
