//! Scoped RPC routing for agent-relay.
//!
//! Provides:
//! - `RpcRouter` - coordinator side: which connection serves which scoped method
//! - `RpcHandlerManager` - executing side: local handlers by method name
//! - Scoped method naming (`owner:method`)

pub mod error;
pub mod handler;
pub mod router;

pub use error::RpcError;
pub use handler::{HandlerError, RpcFailure, RpcHandler, RpcHandlerManager};
pub use router::{ConnectionId, RpcRequest, RpcRouter};

/// Separator between the owning scope and the short method name.
pub const SCOPE_SEPARATOR: char = ':';

/// Compose the scoped name `owner:method`.
#[must_use]
pub fn scoped_method(owner: &str, method: &str) -> String {
    format!("{owner}{SCOPE_SEPARATOR}{method}")
}

/// Owning scope of a scoped method name, if it has one.
#[must_use]
pub fn method_scope(method: &str) -> Option<&str> {
    method
        .split_once(SCOPE_SEPARATOR)
        .map(|(owner, _)| owner)
        .filter(|owner| !owner.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_method() {
        assert_eq!(scoped_method("sess1", "git-status"), "sess1:git-status");
    }

    #[test]
    fn test_method_scope() {
        assert_eq!(method_scope("sess1:git-status"), Some("sess1"));
        assert_eq!(method_scope("m1:a:b"), Some("m1"));
        assert_eq!(method_scope("unscoped"), None);
        assert_eq!(method_scope(":x"), None);
    }
}
