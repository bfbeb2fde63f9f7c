//! Store implementations for agent-relay.
//!
//! Provides:
//! - `SqliteStore` - durable embedded store (feature: sqlite)
//! - `MemoryStore` - process-local store for tests and ephemeral setups (feature: memory)

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, SqliteStoreConfig};
