use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

use crate::error::{ArbiterError, Result};
use crate::infrastructure::UsageObserver;
use crate::priority::PriorityModel;
use crate::types::{ClientDescriptor, DeviceId, Pid, Priority};

struct Clients {
    /// Kept in insertion order.
    entries: Vec<ClientDescriptor>,
    next_seq: u64,
}

/// Active clients, at most one per device id.
///
/// The table's mutex is the engine's table-wide lock. Single calls on the
/// table are atomic; multi-step sequences go through [`ClientTable::lock`].
pub struct ClientTable {
    clients: Mutex<Clients>,
    removed: Condvar,
    usage: Arc<dyn UsageObserver>,
}

impl ClientTable {
    pub fn new(usage: Arc<dyn UsageObserver>) -> Self {
        Self {
            clients: Mutex::new(Clients {
                entries: Vec::new(),
                next_seq: 1,
            }),
            removed: Condvar::new(),
            usage,
        }
    }

    /// Acquires the table-wide lock.
    pub fn lock(&self) -> TableGuard<'_> {
        TableGuard {
            table: self,
            clients: self.clients.lock(),
        }
    }

    pub fn insert(&self, descriptor: ClientDescriptor) -> Result<ClientDescriptor> {
        self.lock().insert(descriptor)
    }

    pub fn remove(&self, id: &DeviceId) -> Option<ClientDescriptor> {
        self.lock().remove(id)
    }

    pub fn remove_client(&self, descriptor: &ClientDescriptor) -> bool {
        self.lock().remove_client(descriptor)
    }

    pub fn get(&self, id: &DeviceId) -> Option<ClientDescriptor> {
        self.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<ClientDescriptor> {
        self.lock().entries().to_vec()
    }

    pub fn all_owned_by(&self, pid: Pid) -> Vec<ClientDescriptor> {
        self.lock().all_owned_by(pid)
    }

    pub fn len(&self) -> usize {
        self.lock().entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until `descriptor` has left the table or `timeout` elapses.
    /// Returns whether it was removed. Must not be called with the table locked.
    pub fn wait_until_removed(&self, descriptor: &ClientDescriptor, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut clients = self.clients.lock();
        loop {
            if !clients.entries.iter().any(|c| c.seq == descriptor.seq) {
                return true;
            }
            if self.removed.wait_until(&mut clients, deadline).timed_out() {
                return !clients.entries.iter().any(|c| c.seq == descriptor.seq);
            }
        }
    }
}

/// The table-wide lock, held across a multi-step sequence.
pub struct TableGuard<'a> {
    table: &'a ClientTable,
    clients: MutexGuard<'a, Clients>,
}

impl<'a> TableGuard<'a> {
    /// Releases the lock, handing back the table so it can be re-acquired.
    pub fn unlock(self) -> &'a ClientTable {
        self.table
    }

    pub fn entries(&self) -> &[ClientDescriptor] {
        &self.clients.entries
    }

    pub fn get(&self, id: &DeviceId) -> Option<&ClientDescriptor> {
        self.clients.entries.iter().find(|c| c.device_id() == id)
    }

    pub fn find_session(&self, session_id: &str) -> Option<&ClientDescriptor> {
        self.clients
            .entries
            .iter()
            .find(|c| c.session().is_some_and(|s| s.handle().id() == session_id))
    }

    pub fn all_owned_by(&self, pid: Pid) -> Vec<ClientDescriptor> {
        self.clients
            .entries
            .iter()
            .filter(|c| c.owner() == pid)
            .cloned()
            .collect()
    }

    /// Distinct owners, in insertion order.
    pub fn owners(&self) -> Vec<Pid> {
        let mut owners: Vec<Pid> = Vec::new();
        for client in &self.clients.entries {
            if !owners.contains(&client.owner()) {
                owners.push(client.owner());
            }
        }
        owners
    }

    pub fn update_priorities(&mut self, priorities: &HashMap<Pid, Priority>) {
        for client in &mut self.clients.entries {
            if let Some(priority) = priorities.get(&client.owner()) {
                client.set_priority(*priority);
            }
        }
    }

    /// Inserts a client. Any entry still conflicting with it means a loser
    /// escaped the removal path; nothing is inserted and the condition is reported.
    pub fn insert(&mut self, mut descriptor: ClientDescriptor) -> Result<ClientDescriptor> {
        let stale: Vec<String> = self
            .clients
            .entries
            .iter()
            .filter(|c| PriorityModel::conflicts(&descriptor, c))
            .map(|c| format!("{} (pid {})", c.device_id(), c.owner()))
            .collect();
        if !stale.is_empty() {
            error!(device = %descriptor.device_id(), ?stale, "Invalid state: conflicting clients were not removed in disconnect");
            return Err(ArbiterError::inconsistency(format!(
                "clients {} still active while admitting device {}",
                stale.join(", "),
                descriptor.device_id()
            )));
        }

        descriptor.seq = self.clients.next_seq;
        self.clients.next_seq += 1;
        self.clients.entries.push(descriptor.clone());
        self.table.usage.client_added(&descriptor);
        Ok(descriptor)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<ClientDescriptor> {
        let index = self.clients.entries.iter().position(|c| c.device_id() == id)?;
        Some(self.remove_at(index))
    }

    pub fn remove_session(&mut self, session_id: &str) -> Option<ClientDescriptor> {
        let index = self
            .clients
            .entries
            .iter()
            .position(|c| c.session().is_some_and(|s| s.handle().id() == session_id))?;
        Some(self.remove_at(index))
    }

    pub fn remove_client(&mut self, descriptor: &ClientDescriptor) -> bool {
        match self.clients.entries.iter().position(|c| c.seq == descriptor.seq) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    fn remove_at(&mut self, index: usize) -> ClientDescriptor {
        let removed = self.clients.entries.remove(index);
        self.table.usage.client_removed(&removed);
        self.table.removed.notify_all();
        removed
    }
}
