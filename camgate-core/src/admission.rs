//! Admission control: validate, decide, evict, admit.
//!
//! Admissions are serialized by a gate acquired with a bounded wait. Within
//! one admission the table lock is held from the decision until the new
//! client is inserted, except while the eviction executor waits for losers.
//! The hardware session is opened with the table lock held, so a slow open
//! stalls disconnects and snapshots until it returns.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client_table::TableGuard;
use crate::engine::Shared;
use crate::error::{ArbiterError, BusyReason, Result};
use crate::event_log::{ArbiterEvent, ClientSummary};
use crate::eviction::{EvictionExecutor, EvictionResult};
use crate::infrastructure::{AccessPolicy, ClientCallbacks, DisconnectReason, PriorityOracle};
use crate::priority::{PriorityModel, PriorityOrdering};
use crate::session::ClientSession;
use crate::types::{
    CallerIdentity, ClientDescriptor, ClientInfo, ClientKind, DeviceId, DeviceStatus, Pid, Priority,
};

/// A request to open a device.
#[derive(Clone)]
pub struct ConnectRequest {
    pub device_id: DeviceId,
    pub caller: CallerIdentity,
    pub kind: ClientKind,
    pub remote: Arc<dyn ClientCallbacks>,
}

impl ConnectRequest {
    pub fn new(device_id: impl Into<DeviceId>, caller: CallerIdentity, remote: Arc<dyn ClientCallbacks>) -> Self {
        Self {
            device_id: device_id.into(),
            caller,
            kind: ClientKind::Modern,
            remote,
        }
    }

    pub fn with_kind(mut self, kind: ClientKind) -> Self {
        self.kind = kind;
        self
    }
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("device_id", &self.device_id)
            .field("caller", &self.caller)
            .field("kind", &self.kind)
            .field("endpoint", &self.remote.endpoint())
            .finish()
    }
}

/// A successful admission.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The admitted client as inserted in the table.
    pub client: ClientDescriptor,
    /// True when a live duplicate of the same caller was handed back.
    pub reused: bool,
    /// Clients torn down to make room.
    pub evicted: Vec<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnknownDevice,
    DeviceUnavailable(DeviceStatus),
    NotAuthorized(String),
}

#[derive(Debug, Clone)]
pub enum AdmissionResult {
    Admitted(Admission),
    Rejected(RejectReason),
    Busy(BusyReason),
    /// Losers did not finish teardown within the wait budget.
    TimedOut { pending: usize },
}

impl AdmissionResult {
    /// Turns a non-admitted outcome into the matching error.
    pub fn into_result(self, request: &ConnectRequest, wait_budget: Duration) -> Result<Admission> {
        let device = request.device_id.clone();
        match self {
            AdmissionResult::Admitted(admission) => Ok(admission),
            AdmissionResult::Rejected(RejectReason::UnknownDevice) => Err(ArbiterError::UnknownDevice { device }),
            AdmissionResult::Rejected(RejectReason::DeviceUnavailable(status)) => {
                Err(ArbiterError::DeviceUnavailable { device, status })
            }
            AdmissionResult::Rejected(RejectReason::NotAuthorized(reason)) => Err(ArbiterError::NotAuthorized {
                device,
                pid: request.caller.pid,
                reason,
            }),
            AdmissionResult::Busy(reason) => Err(ArbiterError::Busy { device, reason }),
            AdmissionResult::TimedOut { pending } => Err(ArbiterError::TimedOut {
                device,
                timeout: wait_budget,
                pending,
            }),
        }
    }
}

/// What admitting a candidate would take, computed against one snapshot of the table.
#[derive(Debug, Clone)]
pub enum AdmissionPlan {
    Proceed { losers: Vec<ClientDescriptor> },
    Blocked {
        blockers: Vec<ClientDescriptor>,
        over_budget: bool,
    },
}

impl AdmissionPlan {
    /// Decides which clients must go for `candidate` to be admitted.
    ///
    /// Conflicting clients of lower or equal priority are losers; a single
    /// higher-priority conflicting client blocks the candidate. Then, while
    /// the total cost exceeds `max_total_cost`, non-conflicting clients of
    /// other processes are added to the losers, lowest priority first and,
    /// among equals, most recently admitted first.
    pub fn compute(candidate: &ClientDescriptor, entries: &[ClientDescriptor], max_total_cost: u32) -> Self {
        let mut losers = Vec::new();
        let mut blockers = Vec::new();
        let mut others: Vec<&ClientDescriptor> = Vec::new();

        for client in entries {
            if !PriorityModel::conflicts(candidate, client) {
                others.push(client);
            } else if PriorityModel::compare(client.priority(), candidate.priority()) == PriorityOrdering::Higher {
                blockers.push(client.clone());
            } else {
                losers.push(client.clone());
            }
        }

        if !blockers.is_empty() {
            return AdmissionPlan::Blocked {
                blockers,
                over_budget: false,
            };
        }

        let max = u64::from(max_total_cost);
        let mut total: u64 = u64::from(candidate.cost()) + others.iter().map(|c| u64::from(c.cost())).sum::<u64>();
        if total <= max {
            return AdmissionPlan::Proceed { losers };
        }

        let mut evictable: Vec<&ClientDescriptor> = others
            .iter()
            .copied()
            .filter(|c| {
                c.cost() > 0
                    && c.owner() != candidate.owner()
                    && PriorityModel::compare(c.priority(), candidate.priority()) != PriorityOrdering::Higher
            })
            .collect();
        evictable.sort_by(|a, b| PriorityModel::ordering(a.priority(), b.priority()).then(b.seq.cmp(&a.seq)));

        let mut budget_losers: Vec<u64> = Vec::new();
        for client in evictable {
            if total <= max {
                break;
            }
            total -= u64::from(client.cost());
            budget_losers.push(client.seq);
            losers.push(client.clone());
        }

        if total > max {
            let holders: Vec<ClientDescriptor> = others
                .iter()
                .filter(|c| c.cost() > 0 && !budget_losers.contains(&c.seq) && c.owner() != candidate.owner())
                .map(|c| (*c).clone())
                .collect();
            if !holders.is_empty() {
                return AdmissionPlan::Blocked {
                    blockers: holders,
                    over_budget: true,
                };
            }
        }

        AdmissionPlan::Proceed { losers }
    }
}

/// Decides every connect and owns the set of device users allowed to connect.
pub struct AdmissionController {
    shared: Arc<Shared>,
    oracle: Arc<dyn PriorityOracle>,
    policy: Arc<dyn AccessPolicy>,
    allowed_users: RwLock<BTreeSet<u32>>,
    gate: Mutex<()>,
}

impl AdmissionController {
    pub(crate) fn new(shared: Arc<Shared>, oracle: Arc<dyn PriorityOracle>, policy: Arc<dyn AccessPolicy>) -> Self {
        let allowed_users = RwLock::new(shared.config.allowed_users.clone());
        Self {
            shared,
            oracle,
            policy,
            allowed_users,
            gate: Mutex::new(()),
        }
    }

    pub fn allowed_users(&self) -> BTreeSet<u32> {
        self.allowed_users.read().clone()
    }

    /// Runs `f` with admissions excluded, waiting as long as it takes.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.gate.lock();
        f()
    }

    pub fn admit(&self, request: &ConnectRequest, wait_budget: Duration) -> Result<AdmissionResult> {
        let connect_timeout = self.shared.config.connect_timeout();
        let Some(_gate) = self.gate.try_lock_for(connect_timeout) else {
            error!(
                device = %request.device_id,
                pid = request.caller.pid,
                timeout = ?connect_timeout,
                "Timed out waiting for other clients to finish connecting"
            );
            return Ok(AdmissionResult::Busy(BusyReason::TooManyConnecting));
        };

        if let Some(reason) = self.validate(request) {
            self.log_rejected(request, &reason);
            return Ok(AdmissionResult::Rejected(reason));
        }

        let mut guard = self.shared.table.lock();
        let mut candidate = self.candidate(request)?;

        if request.kind == ClientKind::Legacy {
            if let Some(existing) = Self::live_duplicate(&guard, &candidate) {
                info!(device = %request.device_id, pid = request.caller.pid, "Reusing live session for same-caller reconnect");
                return Ok(AdmissionResult::Admitted(Admission {
                    client: existing,
                    reused: true,
                    evicted: Vec::new(),
                }));
            }
        }

        let priorities = self.priority_snapshot(&guard, request.caller.pid)?;
        guard.update_priorities(&priorities);
        if let Some(priority) = priorities.get(&request.caller.pid) {
            candidate.set_priority(*priority);
        }
        let summary = ClientSummary::new(
            request.device_id.clone(),
            request.caller.pid,
            request.caller.package.clone(),
            candidate.priority(),
        );

        let losers = match AdmissionPlan::compute(&candidate, guard.entries(), self.shared.config.max_total_cost) {
            AdmissionPlan::Proceed { losers } => losers,
            AdmissionPlan::Blocked { blockers, over_budget } => {
                let pids: Vec<Pid> = blockers.iter().map(|b| b.owner()).collect();
                error!(
                    device = %request.device_id,
                    pid = request.caller.pid,
                    score = candidate.priority().score,
                    state = candidate.priority().state,
                    blockers = ?pids,
                    over_budget,
                    "Conflicts with higher-priority clients, refusing to connect"
                );
                self.shared.events.add(ArbiterEvent::Denied {
                    candidate: summary,
                    blockers: blockers.iter().map(ClientSummary::of).collect(),
                });
                let reason = if over_budget {
                    BusyReason::OverBudget { blockers: pids }
                } else {
                    BusyReason::HigherPriority { blockers: pids }
                };
                return Ok(AdmissionResult::Busy(reason));
            }
        };

        for loser in &losers {
            info!(device = %loser.device_id(), pid = loser.owner(), by = request.caller.pid, "Evicting client");
            self.shared.events.add(ArbiterEvent::Evicted {
                holder: ClientSummary::of(loser),
                by: Some(summary.clone()),
                cause: "higher-priority connect".to_string(),
            });
        }

        let (mut guard, eviction) = EvictionExecutor::evict(guard, &losers, wait_budget);
        match eviction {
            EvictionResult::Ok => {}
            EvictionResult::TimedOut { pending } => return Ok(AdmissionResult::TimedOut { pending }),
            EvictionResult::Error(detail) => {
                self.shared.events.add(ArbiterEvent::ServiceError { message: detail.clone() });
                return Err(ArbiterError::InternalInconsistency { detail });
            }
        }

        // The device may have vanished while losers were torn down.
        let status = self.shared.registry.status(&request.device_id)?;
        if !status.is_usable() {
            let reason = RejectReason::DeviceUnavailable(status);
            self.log_rejected(request, &reason);
            return Ok(AdmissionResult::Rejected(reason));
        }

        let session = ClientSession::open(
            &self.shared,
            &request.device_id,
            request.caller.clone(),
            request.kind,
            Arc::clone(&request.remote),
        )
        .inspect_err(|e| {
            error!(device = %request.device_id, pid = request.caller.pid, error = %e, "Could not open device session");
        })?;

        let client = match guard.insert(candidate.with_session(Arc::clone(&session))) {
            Ok(client) => client,
            Err(e) => {
                self.shared.events.add(ArbiterEvent::ServiceError { message: e.to_string() });
                drop(guard);
                session.disconnect();
                return Err(e);
            }
        };

        // A removal landing in between leaves the device NOT_PRESENT, and this
        // transition is then rejected.
        drop(guard);
        self.shared
            .update_status(&request.device_id, DeviceStatus::NotAvailable, &[])?;

        info!(
            device = %request.device_id,
            pid = request.caller.pid,
            package = %request.caller.package,
            session = %session.handle(),
            evicted = losers.len(),
            "Client connected"
        );
        self.shared.events.add(ArbiterEvent::Connected {
            device: request.device_id.clone(),
            pid: request.caller.pid,
            package: request.caller.package.clone(),
        });

        Ok(AdmissionResult::Admitted(Admission {
            client,
            reused: false,
            evicted: losers.iter().map(ClientDescriptor::info).collect(),
        }))
    }

    /// Replaces the allowed device users and disconnects clients of users no
    /// longer allowed. Returns the number of clients disconnected.
    pub fn switch_users(&self, user_ids: &[i32]) -> Result<usize> {
        if let Some(bad) = user_ids.iter().find(|id| **id < 0) {
            error!(user_id = bad, "Ignoring user switch with an invalid user id");
            return Err(ArbiterError::illegal(format!("invalid user id {bad}")));
        }
        let current: BTreeSet<u32> = user_ids.iter().map(|id| id.unsigned_abs()).collect();

        let evicted = self.exclusive(|| {
            let previous = {
                let mut allowed = self.allowed_users.write();
                if *allowed == current {
                    return Vec::new();
                }
                std::mem::replace(&mut *allowed, current.clone())
            };
            info!(previous = ?previous, current = ?current, "Switching allowed users");
            self.shared.events.add(ArbiterEvent::UserSwitch {
                previous,
                current: current.clone(),
            });

            let guard = self.shared.table.lock();
            let sessions: Vec<Arc<ClientSession>> = guard
                .entries()
                .iter()
                .filter_map(|c| c.session())
                .filter(|s| !current.contains(&s.caller().user_id()))
                .cloned()
                .collect();
            drop(guard);

            for session in &sessions {
                info!(device = %session.device_id(), pid = session.caller().pid, "Disconnecting client of a user no longer allowed");
                session.notify_forced_disconnect(DisconnectReason::UserSwitched);
                session.disconnect();
            }
            sessions
        });
        Ok(evicted.len())
    }

    fn validate(&self, request: &ConnectRequest) -> Option<RejectReason> {
        let user = request.caller.user_id();
        if !self.allowed_users.read().contains(&user) {
            return Some(RejectReason::NotAuthorized(format!(
                "callers of user {user} may not use devices while that user is not active"
            )));
        }
        if !self.policy.is_permitted(&request.caller, &request.device_id) {
            return Some(RejectReason::NotAuthorized("permission denied".to_string()));
        }
        match self.shared.registry.status(&request.device_id) {
            Err(_) => Some(RejectReason::UnknownDevice),
            Ok(status) if !status.is_usable() => Some(RejectReason::DeviceUnavailable(status)),
            Ok(_) => None,
        }
    }

    fn log_rejected(&self, request: &ConnectRequest, reason: &RejectReason) {
        let reason = match reason {
            RejectReason::UnknownDevice => "unknown device".to_string(),
            RejectReason::DeviceUnavailable(status) => format!("device status {status}"),
            RejectReason::NotAuthorized(why) => why.clone(),
        };
        error!(device = %request.device_id, pid = request.caller.pid, %reason, "Rejected connect");
        self.shared.events.add(ArbiterEvent::Rejected {
            device: request.device_id.clone(),
            pid: request.caller.pid,
            package: request.caller.package.clone(),
            reason,
        });
    }

    fn candidate(&self, request: &ConnectRequest) -> Result<ClientDescriptor> {
        let record = self
            .shared
            .registry
            .get(&request.device_id)
            .ok_or_else(|| ArbiterError::UnknownDevice {
                device: request.device_id.clone(),
            })?;
        Ok(ClientDescriptor::new(
            record.id,
            request.caller.pid,
            record.resource_cost,
            record.conflicting,
            Priority::LOWEST,
            request.kind,
        )
        .with_endpoint(request.remote.endpoint()))
    }

    /// A live legacy client of the same device, process and endpoint that is
    /// the only client in the candidate's way.
    fn live_duplicate(guard: &TableGuard<'_>, candidate: &ClientDescriptor) -> Option<ClientDescriptor> {
        let existing = guard.get(candidate.device_id())?;
        let same_caller = existing.kind() == ClientKind::Legacy
            && existing.owner() == candidate.owner()
            && existing.endpoint() == candidate.endpoint()
            && existing.session().is_some_and(|s| !s.is_disconnected());
        if !same_caller {
            return None;
        }
        let in_the_way = guard
            .entries()
            .iter()
            .filter(|c| PriorityModel::conflicts(candidate, c))
            .count();
        (in_the_way == 1).then(|| existing.clone())
    }

    /// One priority per active owner plus the candidate, valid for this attempt only.
    fn priority_snapshot(&self, guard: &TableGuard<'_>, candidate: Pid) -> Result<HashMap<Pid, Priority>> {
        let mut pids = guard.owners();
        if !pids.contains(&candidate) {
            pids.push(candidate);
        }
        let priorities = self.oracle.process_priorities(&pids).map_err(|e| {
            warn!(error = %e, "Priority query failed");
            ArbiterError::PriorityQuery(e)
        })?;
        if priorities.len() != pids.len() {
            return Err(ArbiterError::PriorityQuery(format!(
                "asked for {} priorities, got {}",
                pids.len(),
                priorities.len()
            )));
        }
        debug!(?pids, "Fetched process priorities");
        Ok(pids.into_iter().zip(priorities).collect())
    }
}
