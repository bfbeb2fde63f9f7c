//! Transport between runners, viewers and the coordinator.
//!
//! Provides:
//! - Wire protocol (JSON frames tagged by `type`)
//! - Coordinator WebSocket endpoint (feature: websocket)
//! - Reconnecting runner client (feature: client)

pub mod error;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "client")]
pub use client::{ClientConfig, Presence, RelayClient};
pub use error::TransportError;
pub use protocol::{ClientMessage, ServerMessage};
#[cfg(feature = "websocket")]
pub use websocket::{RelayState, relay_router};
