use crate::error::HardwareError;
use crate::types::{
    CallerIdentity, ClientDescriptor, CompatParams, DeviceId, DeviceInfo, EndpointId, Pid, Priority,
};

// The engine never owns these collaborators' lifecycles. Every implementation
// must be callable from any thread.

/// Token for an open hardware session, issued by the hardware module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardwareSession {
    pub id: u64,
    pub device_id: DeviceId,
}

/// Contract of the driver layer that actually opens devices.
pub trait HardwareModule: Send + Sync {
    /// Devices known at startup.
    fn enumerate_devices(&self) -> Vec<DeviceInfo>;

    /// Static info for a device that appeared after startup.
    fn device_info(&self, id: &DeviceId) -> Result<DeviceInfo, HardwareError>;

    fn open_session(&self, id: &DeviceId) -> Result<HardwareSession, HardwareError>;

    /// Blocks until the device is released.
    fn close_session(&self, session: &HardwareSession);

    /// Requests a torch change. Completion is reported back through the
    /// engine's torch status callback.
    fn set_torch_mode(&self, id: &DeviceId, enabled: bool) -> Result<(), HardwareError>;

    fn legacy_parameters(&self, id: &DeviceId) -> Result<CompatParams, HardwareError>;
}

/// Source of truth for process importance. Pull-only.
pub trait PriorityOracle: Send + Sync {
    /// Returns one priority per pid, in the same order.
    fn process_priorities(&self, pids: &[Pid]) -> Result<Vec<Priority>, String>;
}

/// Permission check applied to every connect.
pub trait AccessPolicy: Send + Sync {
    fn is_permitted(&self, caller: &CallerIdentity, device: &DeviceId) -> bool;
}

/// Grants every caller access.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_permitted(&self, _caller: &CallerIdentity, _device: &DeviceId) -> bool {
        true
    }
}

/// Why a client lost its session without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Evicted,
    DeviceRemoved,
    UserSwitched,
}

/// The caller's side of the transport: identity of its endpoint plus the
/// callback channel for forced disconnects.
pub trait ClientCallbacks: Send + Sync {
    fn endpoint(&self) -> EndpointId;

    fn on_forced_disconnect(&self, _device: &DeviceId, _reason: DisconnectReason) {}
}

/// Accounting hooks for device and torch usage.
pub trait UsageObserver: Send + Sync {
    fn client_added(&self, _client: &ClientDescriptor) {}

    fn client_removed(&self, _client: &ClientDescriptor) {}

    fn torch_on(&self, _device: &DeviceId, _owner: Pid) {}

    fn torch_off(&self, _device: &DeviceId, _owner: Pid) {}
}

pub struct NoopUsage;

impl UsageObserver for NoopUsage {}

/// Liveness notifications from the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    ProcessDied(Pid),
}
