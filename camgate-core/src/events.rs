//! Synchronous fan-out of device and torch status changes.
//!
//! Delivery happens on the thread that produced the accepted transition, in
//! subscription order, while the producer still holds its lock. Listeners
//! therefore see transitions of one device in exactly the order they were
//! accepted. A status callback may read the client list, except on
//! NOT_PRESENT, which is delivered with the client table locked. Callbacks
//! must not read device records or change engine state.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{ArbiterError, Result};
use crate::types::{DeviceId, DeviceStatus, TorchStatus};

/// Observer of status transitions.
pub trait StatusListener: Send + Sync {
    fn on_status_changed(&self, device: &DeviceId, status: DeviceStatus);

    fn on_torch_status_changed(&self, _device: &DeviceId, _status: TorchStatus) {}
}

pub struct EventFanout {
    listeners: Mutex<Vec<Arc<dyn StatusListener>>>,
}

fn same_listener(a: &Arc<dyn StatusListener>, b: &Arc<dyn StatusListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl EventFanout {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn StatusListener>) -> Result<()> {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return Err(ArbiterError::illegal("listener already registered"));
        }
        listeners.push(listener);
        Ok(())
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn StatusListener>) -> Result<()> {
        let mut listeners = self.listeners.lock();
        match listeners.iter().position(|l| same_listener(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                Ok(())
            }
            None => Err(ArbiterError::illegal("unregistered listener given to unsubscribe")),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_status_changed(&self, device: &DeviceId, status: DeviceStatus) {
        for listener in self.listeners.lock().iter() {
            listener.on_status_changed(device, status);
        }
    }

    pub fn notify_torch_status_changed(&self, device: &DeviceId, status: TorchStatus) {
        for listener in self.listeners.lock().iter() {
            listener.on_torch_status_changed(device, status);
        }
    }
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}
