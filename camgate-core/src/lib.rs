//! # camgate-core
//!
//! Admission control and priority arbitration for shared camera devices.
//! Tracks device presence, decides which process may hold which device,
//! evicts lower-priority holders through a bounded-wait teardown, and fans
//! status changes out to observers.

pub mod admission;
pub mod client_table;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod events;
pub mod eviction;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
pub mod priority;
pub mod registry;
pub mod session;
pub mod torch;
pub mod types;

pub use admission::{AdmissionResult, ConnectRequest};
pub use config::EngineConfig;
pub use engine::{ArbiterEngine, Connection, EngineBuilder, EngineDump};
pub use error::{ArbiterError, BusyReason, HardwareError, Result};

#[cfg(test)]
mod client_table_test;
#[cfg(test)]
mod engine_test;
