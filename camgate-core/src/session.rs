//! A live device session and its single removal path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::error::Result;
use crate::event_log::ArbiterEvent;
use crate::infrastructure::{ClientCallbacks, DisconnectReason, HardwareSession};
use crate::types::{CallerIdentity, ClientKind, DeviceId, DeviceStatus, EndpointId, SessionHandle};

/// States a device cannot be returned to PRESENT from when its session closes.
const CLOSE_REJECT_SOURCES: [DeviceStatus; 2] = [DeviceStatus::NotPresent, DeviceStatus::Enumerating];

/// An open session held by one client.
///
/// Every way a client can go away (explicit disconnect, eviction, device
/// removal, process death, user switch) ends in [`ClientSession::disconnect`],
/// which is the only place a live session leaves the client table.
pub struct ClientSession {
    handle: SessionHandle,
    caller: CallerIdentity,
    kind: ClientKind,
    remote: Arc<dyn ClientCallbacks>,
    hardware: HardwareSession,
    disconnected: AtomicBool,
    shared: Weak<Shared>,
}

impl ClientSession {
    /// Opens the hardware session. The caller inserts the session into the
    /// table; on failure nothing has been opened.
    pub(crate) fn open(
        shared: &Arc<Shared>,
        device_id: &DeviceId,
        caller: CallerIdentity,
        kind: ClientKind,
        remote: Arc<dyn ClientCallbacks>,
    ) -> Result<Arc<Self>> {
        let hardware = shared.hardware.open_session(device_id)?;
        let session = Arc::new(Self {
            handle: SessionHandle::generate(device_id.clone()),
            caller,
            kind,
            remote,
            hardware,
            disconnected: AtomicBool::new(false),
            shared: Arc::downgrade(shared),
        });
        debug!(session = %session.handle, pid = session.caller.pid, "Opened device session");
        Ok(session)
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn device_id(&self) -> &DeviceId {
        self.handle.device_id()
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn endpoint(&self) -> EndpointId {
        self.remote.endpoint()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn notify_forced_disconnect(&self, reason: DisconnectReason) {
        if !self.is_disconnected() {
            self.remote.on_forced_disconnect(self.device_id(), reason);
        }
    }

    /// Tears the session down. Idempotent: only the first call does anything.
    ///
    /// Closes the hardware session (which may block), returns the device to
    /// PRESENT, then removes the client from the table. Must not be called
    /// with the table lock held.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            debug!(session = %self.handle, "Session already disconnected");
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            warn!(session = %self.handle, "Engine dropped before session disconnect");
            return;
        };

        shared.hardware.close_session(&self.hardware);

        // Status first: removal from the table is what evictors wait on.
        if let Err(e) = shared.update_status(self.device_id(), DeviceStatus::Present, &CLOSE_REJECT_SOURCES) {
            warn!(device = %self.device_id(), error = %e, "Could not restore device status after disconnect");
        }

        let removed = shared.table.lock().remove_session(self.handle.id()).is_some();
        info!(
            device = %self.device_id(),
            pid = self.caller.pid,
            package = %self.caller.package,
            removed,
            "Client disconnected"
        );
        shared.events.add(ArbiterEvent::Disconnected {
            device: self.device_id().clone(),
            pid: self.caller.pid,
            package: self.caller.package.clone(),
        });
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("handle", &self.handle)
            .field("caller", &self.caller)
            .field("kind", &self.kind)
            .field("hardware", &self.hardware)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
