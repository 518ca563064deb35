use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::DeviceId;
use crate::session::ClientSession;

/// Process identifier of a caller.
pub type Pid = i32;

/// User identifier of a caller.
pub type Uid = u32;

/// Width of the uid range owned by one device user.
pub const PER_USER_RANGE: Uid = 100_000;

/// Importance of a process at the moment of an admission attempt.
///
/// Higher `score` wins. On equal scores the lower `state` wins, process
/// states being ordered most-foreground first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub score: i32,
    pub state: i32,
}

impl Priority {
    /// Reported for processes the priority source knows nothing about.
    pub const LOWEST: Priority = Priority {
        score: i32::MIN,
        state: i32::MAX,
    };

    pub const fn new(score: i32, state: i32) -> Self {
        Self { score, state }
    }
}

/// Identity of the remote end of a caller's transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is asking for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub pid: Pid,
    pub uid: Uid,
    pub package: String,
}

impl CallerIdentity {
    pub fn new(pid: Pid, uid: Uid, package: impl Into<String>) -> Self {
        Self {
            pid,
            uid,
            package: package.into(),
        }
    }

    /// The device user the caller's uid belongs to.
    pub fn user_id(&self) -> u32 {
        self.uid / PER_USER_RANGE
    }
}

/// API flavor a client connected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// Older single-session API; same-endpoint reconnects reuse the live session.
    Legacy,
    Modern,
}

/// Opaque token for a live device session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    id: String,
    device_id: DeviceId,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            id: id.into(),
            device_id,
        }
    }

    pub(crate) fn generate(device_id: DeviceId) -> Self {
        Self::new(nanoid::nanoid!(), device_id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.device_id)
    }
}

/// A client's claim on a device, as held by the client table.
///
/// The session is absent while the descriptor is still being admitted.
#[derive(Clone)]
pub struct ClientDescriptor {
    device_id: DeviceId,
    owner: Pid,
    cost: u32,
    conflicting: BTreeSet<DeviceId>,
    priority: Priority,
    kind: ClientKind,
    endpoint: Option<EndpointId>,
    session: Option<Arc<ClientSession>>,
    /// Insertion order in the client table; 0 until inserted.
    pub(crate) seq: u64,
}

impl ClientDescriptor {
    pub fn new(
        device_id: DeviceId,
        owner: Pid,
        cost: u32,
        conflicting: BTreeSet<DeviceId>,
        priority: Priority,
        kind: ClientKind,
    ) -> Self {
        Self {
            device_id,
            owner,
            cost,
            conflicting,
            priority,
            kind,
            endpoint: None,
            session: None,
            seq: 0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointId) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub(crate) fn with_session(mut self, session: Arc<ClientSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn conflicting(&self) -> &BTreeSet<DeviceId> {
        &self.conflicting
    }

    pub fn is_conflicting(&self, device: &DeviceId) -> bool {
        self.conflicting.contains(device)
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn endpoint(&self) -> Option<&EndpointId> {
        self.endpoint.as_ref()
    }

    pub fn session(&self) -> Option<&Arc<ClientSession>> {
        self.session.as_ref()
    }

    /// Serializable snapshot for callers and diagnostics.
    pub fn info(&self) -> ClientInfo {
        let caller = self.session.as_ref().map(|s| s.caller());
        ClientInfo {
            device_id: self.device_id.clone(),
            pid: self.owner,
            uid: caller.map(|c| c.uid),
            package: caller.map(|c| c.package.clone()),
            cost: self.cost,
            conflicting: self.conflicting.clone(),
            priority: self.priority,
            kind: self.kind,
            session_id: self.session.as_ref().map(|s| s.handle().id().to_string()),
        }
    }
}

impl std::fmt::Debug for ClientDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDescriptor")
            .field("device_id", &self.device_id)
            .field("owner", &self.owner)
            .field("cost", &self.cost)
            .field("conflicting", &self.conflicting)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("session", &self.session.as_ref().map(|s| s.handle().id()))
            .field("seq", &self.seq)
            .finish()
    }
}

/// Read-only view of an active client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub device_id: DeviceId,
    pub pid: Pid,
    pub uid: Option<Uid>,
    pub package: Option<String>,
    pub cost: u32,
    pub conflicting: BTreeSet<DeviceId>,
    pub priority: Priority,
    pub kind: ClientKind,
    pub session_id: Option<String>,
}
