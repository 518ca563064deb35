use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{ClientDescriptor, DeviceId, Pid, Priority};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A client as named in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    pub device: DeviceId,
    pub pid: Pid,
    pub package: String,
    pub priority: Priority,
}

impl ClientSummary {
    pub fn new(device: DeviceId, pid: Pid, package: impl Into<String>, priority: Priority) -> Self {
        Self {
            device,
            pid,
            package: package.into(),
            priority,
        }
    }

    pub fn of(client: &ClientDescriptor) -> Self {
        Self {
            device: client.device_id().clone(),
            pid: client.owner(),
            package: client
                .session()
                .map(|s| s.caller().package.clone())
                .unwrap_or_default(),
            priority: client.priority(),
        }
    }
}

impl std::fmt::Display for ClientSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "device {} client for package {} (PID {}, score {}, state {})",
            self.device, self.package, self.pid, self.priority.score, self.priority.state
        )
    }
}

/// Notable arbitration events kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArbiterEvent {
    Connected {
        device: DeviceId,
        pid: Pid,
        package: String,
    },
    Disconnected {
        device: DeviceId,
        pid: Pid,
        package: String,
    },
    Evicted {
        holder: ClientSummary,
        /// `None` when the eviction was not caused by a competing client.
        by: Option<ClientSummary>,
        cause: String,
    },
    Denied {
        candidate: ClientSummary,
        blockers: Vec<ClientSummary>,
    },
    Rejected {
        device: DeviceId,
        pid: Pid,
        package: String,
        reason: String,
    },
    DeviceAdded {
        device: DeviceId,
        reason: String,
    },
    DeviceRemoved {
        device: DeviceId,
        reason: String,
    },
    ClientDied {
        pid: Pid,
        reason: String,
    },
    UserSwitch {
        previous: BTreeSet<u32>,
        current: BTreeSet<u32>,
    },
    ServiceError {
        message: String,
    },
}

impl std::fmt::Display for ArbiterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArbiterEvent::Connected { device, pid, package } => {
                write!(f, "CONNECT device {device} client for package {package} (PID {pid})")
            }
            ArbiterEvent::Disconnected { device, pid, package } => {
                write!(f, "DISCONNECT device {device} client for package {package} (PID {pid})")
            }
            ArbiterEvent::Evicted { holder, by, cause } => {
                write!(f, "EVICT {holder}")?;
                match by {
                    Some(by) => write!(f, " - Evicted by {by}"),
                    None => write!(f, " - Evicted due to {cause}"),
                }
            }
            ArbiterEvent::Denied { candidate, blockers } => {
                write!(f, "DENIED connect {candidate} due to eviction policy")?;
                for blocker in blockers {
                    write!(f, "\n   - Blocked by existing {blocker}")?;
                }
                Ok(())
            }
            ArbiterEvent::Rejected { device, pid, package, reason } => write!(
                f,
                "REJECT device {device} client for package {package} (PID {pid}), reason: ({reason})"
            ),
            ArbiterEvent::DeviceAdded { device, reason } => {
                write!(f, "ADD device {device}, reason: ({reason})")
            }
            ArbiterEvent::DeviceRemoved { device, reason } => {
                write!(f, "REMOVE device {device}, reason: ({reason})")
            }
            ArbiterEvent::ClientDied { pid, reason } => {
                write!(f, "DIED client(s) with PID {pid}, reason: ({reason})")
            }
            ArbiterEvent::UserSwitch { previous, current } => {
                let previous = if previous.is_empty() {
                    "<None>".to_string()
                } else {
                    format!("{previous:?}")
                };
                write!(
                    f,
                    "USER_SWITCH previous allowed user IDs: {previous}, current allowed user IDs: {current:?}"
                )
            }
            ArbiterEvent::ServiceError { message } => write!(f, "SERVICE ERROR: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub at_ms: u64,
    pub event: ArbiterEvent,
}

impl std::fmt::Display for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} : {}", self.at_ms, self.event)
    }
}

/// Bounded ring of recent events; the oldest record is dropped first.
pub struct EventLog {
    capacity: usize,
    records: Mutex<VecDeque<EventRecord>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn add(&self, event: ArbiterEvent) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(EventRecord {
            at_ms: now_ms(),
            event,
        });
    }

    /// Most recent first.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }
}
