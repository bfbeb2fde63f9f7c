//! Coordinator-side sync engine.
//!
//! Keeps an in-memory view of sessions and machines on top of a
//! [`agent_relay_core::VersionedStore`], tracks liveness from heartbeats,
//! fans changes out as [`agent_relay_core::SyncEvent`]s and forwards RPC
//! calls through an [`agent_relay_rpc::RpcRouter`].

mod actor;
pub mod clock;
pub mod config;
mod engine;
pub mod error;
pub mod liveness;
pub mod todos;

pub use actor::SweepReport;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use liveness::{MachineAlive, SessionAlive, SessionEnd};
