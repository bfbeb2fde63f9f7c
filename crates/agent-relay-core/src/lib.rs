//! Core abstractions shared across agent-relay.
//!
//! This crate provides the fundamental building blocks:
//! - Entity types (`Session`, `Machine`, `Message`, ...)
//! - `VersionedStore` - the optimistic-concurrency storage contract
//! - `UpdateEnvelope` - the wire shape of every versioned mutation
//! - `EventBus` - broadcast + history for sync events

pub mod envelope;
pub mod events;
pub mod payload;
pub mod traits;
pub mod types;

pub use envelope::{CasOutcome, UpdateEnvelope};
pub use events::{EventBus, SyncEvent};
pub use payload::{MachineMetadata, SessionMetadata, TodoItem};
pub use traits::{StoreError, VersionedStore};
pub use types::{Machine, Message, PushKeys, PushSubscription, Session, User};
