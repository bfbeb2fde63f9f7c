//! RPC failure categories.

use std::time::Duration;

use thiserror::Error;

use crate::router::ConnectionId;

/// RPC error.
///
/// `MethodNotFound` and `OwnerDisconnected` are raised without waiting;
/// only `Timeout` consumes the call window.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC method not registered: {0}")]
    MethodNotFound(String),
    #[error("RPC owner of {0} disconnected")]
    OwnerDisconnected(String),
    #[error("RPC call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Registration of {method} rejected: a newer connection owns it")]
    StaleRegistration { method: String },
}

impl RpcError {
    /// Whether the call ran out its window, as opposed to failing fast.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
