use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default wait for the admission gate before a connect fails with Busy.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
/// Default wait per evicted client for its teardown to finish.
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 1_000;
/// Aggregate cost all open sessions may consume.
pub const DEFAULT_MAX_TOTAL_COST: u32 = 100;
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 100;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub max_total_cost: u32,
    pub event_log_capacity: usize,
    /// Device users whose processes may connect.
    pub allowed_users: BTreeSet<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            max_total_cost: DEFAULT_MAX_TOTAL_COST,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            allowed_users: BTreeSet::from([0]),
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_total_cost(mut self, cost: u32) -> Self {
        self.max_total_cost = cost;
        self
    }

    pub fn with_allowed_users(mut self, users: impl IntoIterator<Item = u32>) -> Self {
        self.allowed_users = users.into_iter().collect();
        self
    }
}
