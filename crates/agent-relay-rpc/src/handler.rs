//! Executing-side dispatch of forwarded RPC calls to local handlers.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{SCOPE_SEPARATOR, scoped_method};

/// Error raised by a local handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("invalid params: {e}"))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Failure payload returned to the caller in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub error: String,
}

/// A locally executable RPC method.
///
/// Implement this trait for methods the process exposes to the coordinator.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into an [`RpcHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, params: Value) -> Result<Value, HandlerError> {
        (self.0)(params).await
    }
}

/// Registry of local handlers under one owning scope (a session or machine id).
pub struct RpcHandlerManager {
    scope: String,
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl RpcHandlerManager {
    /// Create a manager whose methods are announced as `scope:method`.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Register `handler` under the short name `method`.
    ///
    /// Returns the scoped name to announce to the coordinator.
    pub fn register(&self, method: &str, handler: Arc<dyn RpcHandler>) -> String {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(method.to_string(), handler);
        }
        scoped_method(&self.scope, method)
    }

    /// Register an async closure under `method`.
    pub fn register_fn<F, Fut>(&self, method: &str, f: F) -> String
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(method, Arc::new(FnHandler(f)))
    }

    /// Remove a handler. Returns the scoped name if one was registered.
    pub fn unregister(&self, method: &str) -> Option<String> {
        let removed = self
            .handlers
            .write()
            .ok()
            .and_then(|mut handlers| handlers.remove(method));
        removed.map(|_| scoped_method(&self.scope, method))
    }

    /// Every scoped method this manager serves, for (re)announcement on connect.
    #[must_use]
    pub fn scoped_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .map(|handlers| {
                handlers
                    .keys()
                    .map(|m| scoped_method(&self.scope, m))
                    .collect()
            })
            .unwrap_or_default();
        methods.sort();
        methods
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn RpcHandler>> {
        let short = method
            .strip_prefix(self.scope.as_str())
            .and_then(|rest| rest.strip_prefix(SCOPE_SEPARATOR))
            .unwrap_or(method);
        self.handlers.read().ok()?.get(short).cloned()
    }

    /// Execute a forwarded call and encode its reply.
    ///
    /// Always returns a JSON string: the handler's result, or an
    /// [`RpcFailure`] when the method is unknown, the params do not parse,
    /// or the handler fails or panics.
    pub async fn handle(&self, method: &str, params: &str) -> String {
        match self.dispatch(method, params).await {
            Ok(value) => serde_json::to_string(&value).unwrap_or_else(|e| failure(&e.to_string())),
            Err(e) => {
                tracing::debug!(method, error = %e, "rpc handler failed");
                failure(&e.0)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: &str) -> Result<Value, HandlerError> {
        let handler = self
            .lookup(method)
            .ok_or_else(|| HandlerError(format!("Method not found: {method}")))?;
        let params: Value = if params.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(params)?
        };

        AssertUnwindSafe(handler.call(params))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")))
    }
}

fn failure(message: &str) -> String {
    serde_json::to_string(&RpcFailure {
        error: message.to_string(),
    })
    .unwrap_or_else(|_| r#"{"error":"unencodable failure"}"#.to_string())
}
