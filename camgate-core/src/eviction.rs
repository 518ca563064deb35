use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::client_table::TableGuard;
use crate::infrastructure::DisconnectReason;
use crate::session::ClientSession;
use crate::types::ClientDescriptor;

/// Outcome of tearing down a set of losers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionResult {
    Ok,
    /// Some losers were still in the table when their wait budget ran out.
    TimedOut { pending: usize },
    Error(String),
}

/// Drives loser teardown through the session's own disconnect path.
///
/// The executor never removes table entries itself. It releases the table
/// lock before waiting, since teardown needs that lock to remove its entry,
/// and re-acquires it before handing control back.
pub struct EvictionExecutor;

impl EvictionExecutor {
    pub fn evict<'a>(
        guard: TableGuard<'a>,
        losers: &[ClientDescriptor],
        wait_budget: Duration,
    ) -> (TableGuard<'a>, EvictionResult) {
        if losers.is_empty() {
            return (guard, EvictionResult::Ok);
        }

        let mut sessions: Vec<Arc<ClientSession>> = Vec::with_capacity(losers.len());
        for loser in losers {
            match loser.session() {
                Some(session) => sessions.push(Arc::clone(session)),
                None => {
                    error!(device = %loser.device_id(), pid = loser.owner(), "Invalid state: client table entry has no session");
                    return (
                        guard,
                        EvictionResult::Error(format!(
                            "client of device {} (pid {}) has no live session",
                            loser.device_id(),
                            loser.owner()
                        )),
                    );
                }
            }
        }

        let table = guard.unlock();

        for session in &sessions {
            session.notify_forced_disconnect(DisconnectReason::Evicted);
        }
        for session in sessions {
            Self::spawn_disconnect(session);
        }

        let mut pending = 0;
        for loser in losers {
            debug!(device = %loser.device_id(), pid = loser.owner(), "Waiting for evicted client to disconnect");
            if !table.wait_until_removed(loser, wait_budget) {
                warn!(device = %loser.device_id(), pid = loser.owner(), budget = ?wait_budget, "Timed out waiting for evicted client to disconnect");
                pending += 1;
            }
        }

        let guard = table.lock();
        let result = if pending == 0 {
            EvictionResult::Ok
        } else {
            EvictionResult::TimedOut { pending }
        };
        (guard, result)
    }

    fn spawn_disconnect(session: Arc<ClientSession>) {
        let name = format!("camgate-evict-{}", session.device_id());
        let fallback = Arc::clone(&session);
        if let Err(e) = thread::Builder::new().name(name).spawn(move || session.disconnect()) {
            warn!(device = %fallback.device_id(), error = %e, "Could not spawn teardown thread, disconnecting inline");
            fallback.disconnect();
        }
    }
}
