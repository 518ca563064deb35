//! The arbitration engine: one instance owns the device registry, the client
//! table, the torch tracker and the event fan-out, and is shared by handle
//! with every request thread and hardware callback.

use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, ConnectRequest};
use crate::client_table::ClientTable;
use crate::config::EngineConfig;
use crate::error::{ArbiterError, Result};
use crate::event_log::{ArbiterEvent, ClientSummary, EventLog, EventRecord};
use crate::events::{EventFanout, StatusListener};
use crate::infrastructure::{
    AccessPolicy, AllowAll, DisconnectReason, HardwareModule, LivenessEvent, NoopUsage, PriorityOracle,
    UsageObserver,
};
use crate::registry::{DeviceRegistry, Transition};
use crate::torch::{TorchInfo, TorchTracker};
use crate::types::{
    ClientInfo, CompatParams, DeviceId, DeviceInfo, DeviceRecord, DeviceStatus, Pid, SessionHandle, TorchStatus,
};

/// State shared by the engine, its admission controller and every session.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: DeviceRegistry,
    pub(crate) table: ClientTable,
    pub(crate) torch: TorchTracker,
    pub(crate) fanout: EventFanout,
    pub(crate) events: EventLog,
    pub(crate) hardware: Arc<dyn HardwareModule>,
    pub(crate) usage: Arc<dyn UsageObserver>,
}

impl Shared {
    /// Status transition with the engine's observers attached: the torch is
    /// kept in step with its camera and listeners are notified, both under
    /// the device's status lock.
    pub(crate) fn update_status(
        &self,
        id: &DeviceId,
        new: DeviceStatus,
        reject_sources: &[DeviceStatus],
    ) -> Result<Transition> {
        self.registry.set_status_with(id, new, reject_sources, |device, _old, new| {
            if new != DeviceStatus::Enumerating {
                self.torch
                    .sync_with_device(device, new, &self.fanout, self.usage.as_ref());
            }
            self.fanout.notify_status_changed(device, new);
        })
    }

    fn register_device(&self, info: DeviceInfo) -> bool {
        let id = info.id.clone();
        let flash = info.has_flash_unit.then(|| TorchStatus::for_device(info.initial_status));
        if !self.registry.register(info) {
            return false;
        }
        if let Some(status) = flash {
            self.torch.register(id, status);
        }
        true
    }
}

/// Outcome of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub handle: SessionHandle,
    /// True when an existing session of the same caller was handed back.
    pub reused: bool,
    pub evicted: Vec<ClientInfo>,
}

/// Serializable snapshot of everything the engine tracks.
#[derive(Debug, Clone, Serialize)]
pub struct EngineDump {
    pub devices: Vec<DeviceRecord>,
    pub clients: Vec<ClientInfo>,
    pub torches: Vec<TorchInfo>,
    pub allowed_users: BTreeSet<u32>,
    pub events: Vec<EventRecord>,
}

/// Builder for an [`ArbiterEngine`] with optional collaborators.
pub struct EngineBuilder {
    hardware: Arc<dyn HardwareModule>,
    oracle: Arc<dyn PriorityOracle>,
    config: EngineConfig,
    policy: Arc<dyn AccessPolicy>,
    usage: Arc<dyn UsageObserver>,
}

impl EngineBuilder {
    pub fn new(hardware: Arc<dyn HardwareModule>, oracle: Arc<dyn PriorityOracle>) -> Self {
        Self {
            hardware,
            oracle,
            config: EngineConfig::default(),
            policy: Arc::new(AllowAll),
            usage: Arc::new(NoopUsage),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the permission check consulted on every connect.
    pub fn access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn usage_observer(mut self, usage: Arc<dyn UsageObserver>) -> Self {
        self.usage = usage;
        self
    }

    /// Builds the engine and registers every device the hardware module enumerates.
    pub fn build(self) -> ArbiterEngine {
        let shared = Arc::new(Shared {
            registry: DeviceRegistry::new(),
            table: ClientTable::new(Arc::clone(&self.usage)),
            torch: TorchTracker::new(),
            fanout: EventFanout::new(),
            events: EventLog::new(self.config.event_log_capacity),
            hardware: self.hardware,
            usage: self.usage,
            config: self.config,
        });

        for info in shared.hardware.enumerate_devices() {
            let id = info.id.clone();
            let status = info.initial_status;
            if shared.register_device(info) {
                info!(device = %id, %status, "Registered device");
            } else {
                warn!(device = %id, "Hardware enumerated a device twice");
            }
        }

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&shared),
            self.oracle,
            self.policy,
        ));
        ArbiterEngine { shared, admission }
    }
}

/// Handle to the arbitration engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ArbiterEngine {
    shared: Arc<Shared>,
    admission: Arc<AdmissionController>,
}

impl ArbiterEngine {
    pub fn builder(hardware: Arc<dyn HardwareModule>, oracle: Arc<dyn PriorityOracle>) -> EngineBuilder {
        EngineBuilder::new(hardware, oracle)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // ─── Callers ────────────────────────────────────────────────────────────

    /// Connects with the configured per-loser teardown budget.
    pub fn connect(&self, request: ConnectRequest) -> Result<Connection> {
        self.connect_within(request, self.shared.config.disconnect_timeout())
    }

    pub fn connect_within(&self, request: ConnectRequest, wait_budget: Duration) -> Result<Connection> {
        let admission = self
            .admission
            .admit(&request, wait_budget)?
            .into_result(&request, wait_budget)?;
        let handle = admission
            .client
            .session()
            .map(|s| s.handle().clone())
            .ok_or_else(|| ArbiterError::inconsistency("admitted client has no session"))?;
        Ok(Connection {
            handle,
            reused: admission.reused,
            evicted: admission.evicted,
        })
    }

    /// Closes a session. Unknown or already closed handles are a no-op.
    pub fn disconnect(&self, handle: &SessionHandle) -> Result<()> {
        self.disconnect_session(handle.id())
    }

    /// Same as [`ArbiterEngine::disconnect`], addressed by session id alone.
    pub fn disconnect_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .shared
            .table
            .lock()
            .find_session(session_id)
            .and_then(|c| c.session().cloned());
        match session {
            Some(session) => session.disconnect(),
            None => debug!(session = session_id, "Disconnect of a session no longer active"),
        }
        Ok(())
    }

    /// Asks the hardware module to switch a torch on or off on behalf of `pid`.
    /// The new status lands through [`ArbiterEngine::on_torch_status_changed`].
    pub fn set_torch_mode(&self, device: &DeviceId, pid: Pid, enabled: bool) -> Result<()> {
        let Some(record) = self.shared.registry.get(device) else {
            return Err(ArbiterError::illegal(format!("unknown device \"{device}\"")));
        };
        if !record.has_flash_unit {
            return Err(ArbiterError::illegal(format!("device \"{device}\" does not have a flash unit")));
        }
        // Camera status and torch availability are judged as one step.
        self.shared.registry.with_status(device, |camera| -> Result<()> {
            if !camera.is_usable() {
                return Err(ArbiterError::illegal(format!(
                    "device \"{device}\" is not available (status {camera})"
                )));
            }
            self.shared.torch.check_available(device, camera)?;
            self.shared.torch.set_pending_owner(device, pid);
            Ok(())
        })??;

        self.shared.hardware.set_torch_mode(device, enabled).inspect_err(|e| {
            error!(device = %device, pid, enabled, error = %e, "Torch request failed");
        })?;
        self.shared.torch.track_enabled(device, pid, enabled);
        info!(device = %device, pid, enabled, "Torch mode requested");
        Ok(())
    }

    /// Registers a listener and returns the status of every known device.
    /// The current torch statuses are replayed to that listener only.
    pub fn subscribe(&self, listener: Arc<dyn StatusListener>) -> Result<Vec<(DeviceId, DeviceStatus)>> {
        self.shared.fanout.subscribe(Arc::clone(&listener))?;
        self.shared.torch.replay(listener.as_ref());
        Ok(self.shared.registry.statuses())
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn StatusListener>) -> Result<()> {
        self.shared.fanout.unsubscribe(listener)
    }

    pub fn list_devices(&self) -> Vec<(DeviceId, DeviceStatus)> {
        self.shared.registry.statuses()
    }

    /// Cached legacy parameters, fetched from the hardware module on first use.
    pub fn legacy_parameters(&self, device: &DeviceId) -> Result<CompatParams> {
        let status = self.shared.registry.status(device)?;
        if !status.is_usable() {
            return Err(ArbiterError::DeviceUnavailable {
                device: device.clone(),
                status,
            });
        }
        if let Some(cached) = self.shared.registry.cached_compat_params(device)? {
            return Ok(cached);
        }
        let params = self.shared.hardware.legacy_parameters(device)?;
        self.shared.registry.set_cached_compat_params(device, params.clone())?;
        Ok(params)
    }

    // ─── Hardware callbacks ─────────────────────────────────────────────────

    /// Raw device status from the hardware module. Unrecognized codes are
    /// treated as NOT_PRESENT.
    pub fn on_device_status_changed(&self, device: &DeviceId, raw: i32) -> Result<Transition> {
        let status = DeviceStatus::from_raw(raw).unwrap_or_else(|| {
            warn!(device = %device, raw, "Unknown device status code, treating as NOT_PRESENT");
            DeviceStatus::NotPresent
        });
        self.set_device_status(device, status)
    }

    pub fn set_device_status(&self, device: &DeviceId, status: DeviceStatus) -> Result<Transition> {
        if !self.shared.registry.contains(device) {
            if status != DeviceStatus::Present {
                error!(device = %device, %status, "Status change for an unknown device");
                return Err(ArbiterError::UnknownDevice { device: device.clone() });
            }
            self.hot_plug(device)?;
        }

        if status == DeviceStatus::NotPresent {
            return self.remove_device(device);
        }

        let transition = self.shared.update_status(device, status, &[])?;
        if transition.accepted && transition.old == DeviceStatus::NotPresent {
            info!(device = %device, %status, "Device added");
            self.shared.events.add(ArbiterEvent::DeviceAdded {
                device: device.clone(),
                reason: "Device status changed".to_string(),
            });
        }
        Ok(transition)
    }

    fn hot_plug(&self, device: &DeviceId) -> Result<()> {
        let info = self
            .shared
            .hardware
            .device_info(device)?
            .with_initial_status(DeviceStatus::NotPresent);
        if self.shared.register_device(info) {
            info!(device = %device, "Registered hot-plugged device");
        }
        Ok(())
    }

    /// Marks a device NOT_PRESENT and drops its client under the table lock,
    /// then runs the client's teardown outside it.
    fn remove_device(&self, device: &DeviceId) -> Result<Transition> {
        let (transition, removed) = {
            let mut guard = self.shared.table.lock();
            let transition = self.shared.update_status(device, DeviceStatus::NotPresent, &[])?;
            (transition, guard.remove(device))
        };

        if transition.accepted {
            info!(device = %device, "Device removed");
            self.shared.events.add(ArbiterEvent::DeviceRemoved {
                device: device.clone(),
                reason: "Device status changed".to_string(),
            });
        }

        if let Some(client) = removed {
            self.shared.events.add(ArbiterEvent::Evicted {
                holder: ClientSummary::of(&client),
                by: None,
                cause: "device removal".to_string(),
            });
            match client.session() {
                Some(session) => {
                    session.notify_forced_disconnect(DisconnectReason::DeviceRemoved);
                    session.disconnect();
                }
                None => error!(device = %device, "Invalid state: removed client has no session"),
            }
        }
        Ok(transition)
    }

    /// Raw torch status from the hardware module. Unrecognized codes are ignored.
    pub fn on_torch_status_changed(&self, device: &DeviceId, raw: i32) -> Result<()> {
        let Some(status) = TorchStatus::from_raw(raw) else {
            warn!(device = %device, raw, "Ignoring unknown torch status code");
            return Ok(());
        };
        self.shared.registry.with_status(device, |camera| {
            if !status.permitted_with(camera) {
                warn!(device = %device, torch = %status, camera = %camera, "Ignoring torch status inconsistent with device status");
                return;
            }
            self.shared
                .torch
                .apply(device, status, &self.shared.fanout, self.shared.usage.as_ref());
        })
    }

    // ─── Process lifecycle ──────────────────────────────────────────────────

    /// Cleans up after a dead process: its torches are switched off and its
    /// clients disconnected, with admissions held off meanwhile.
    pub fn on_process_died(&self, pid: Pid) -> usize {
        info!(pid, "Process died");
        self.shared.events.add(ArbiterEvent::ClientDied {
            pid,
            reason: "Process died unexpectedly".to_string(),
        });

        for device in self.shared.torch.enabled_by(pid) {
            if let Err(e) = self.shared.hardware.set_torch_mode(&device, false) {
                error!(device = %device, pid, error = %e, "Could not turn off torch of dead process");
            }
            self.shared.torch.track_enabled(&device, pid, false);
        }

        self.admission.exclusive(|| {
            let clients = self.shared.table.all_owned_by(pid);
            for client in &clients {
                if let Some(session) = client.session() {
                    session.disconnect();
                }
            }
            clients.len()
        })
    }

    /// Consumes liveness events on a dedicated thread until the sender hangs up.
    pub fn watch_liveness(&self, events: Receiver<LivenessEvent>) -> io::Result<JoinHandle<()>> {
        let engine = self.clone();
        thread::Builder::new()
            .name("camgate-liveness".to_string())
            .spawn(move || {
                for event in events {
                    match event {
                        LivenessEvent::ProcessDied(pid) => {
                            engine.on_process_died(pid);
                        }
                    }
                }
                debug!("Liveness channel closed");
            })
    }

    /// Replaces the device users allowed to connect. Returns how many clients
    /// were disconnected.
    pub fn switch_users(&self, user_ids: &[i32]) -> Result<usize> {
        self.admission.switch_users(user_ids)
    }

    pub fn allowed_users(&self) -> BTreeSet<u32> {
        self.admission.allowed_users()
    }

    // ─── Snapshots ──────────────────────────────────────────────────────────

    pub fn device(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.shared.registry.get(id)
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.shared.registry.records()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared.table.all().iter().map(|c| c.info()).collect()
    }

    pub fn client(&self, device: &DeviceId) -> Option<ClientInfo> {
        self.shared.table.get(device).map(|c| c.info())
    }

    pub fn torch_status(&self, device: &DeviceId) -> Option<TorchStatus> {
        self.shared.torch.status(device)
    }

    /// Most recent first.
    pub fn event_log(&self) -> Vec<EventRecord> {
        self.shared.events.records()
    }

    pub fn dump(&self) -> EngineDump {
        EngineDump {
            devices: self.devices(),
            clients: self.clients(),
            torches: self.shared.torch.infos(),
            allowed_users: self.allowed_users(),
            events: self.event_log(),
        }
    }
}
