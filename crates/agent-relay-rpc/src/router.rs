//! Coordinator-side routing of scoped methods to live connections.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::RpcError;

/// Identifier of one live transport connection.
pub type ConnectionId = Uuid;

/// A call forwarded to the connection that owns `method`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: String,
    /// Fully scoped method name.
    pub method: String,
    /// JSON-encoded parameters.
    pub params: String,
}

struct ConnectionEntry {
    generation: u64,
    sender: mpsc::UnboundedSender<RpcRequest>,
}

struct MethodOwner {
    connection: ConnectionId,
    generation: u64,
}

struct PendingCall {
    connection: ConnectionId,
    method: String,
    reply: oneshot::Sender<Result<String, RpcError>>,
}

#[derive(Default)]
struct RouterState {
    next_generation: u64,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    methods: HashMap<String, MethodOwner>,
    pending: HashMap<String, PendingCall>,
}

/// Drops a call's pending entry however `call` ends, including cancellation.
struct PendingGuard<'a> {
    router: &'a RpcRouter,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.lock().pending.remove(self.request_id);
    }
}

/// Maps fully scoped method names to the connection currently serving them.
///
/// The last registration wins, except that a connection attached earlier
/// than the current owner cannot take a method back: every attached
/// connection gets a monotonic generation and registrations carry it.
/// The router keeps no memory of a connection after `disconnect`, so a
/// reconnecting peer must announce its methods again.
#[derive(Default)]
pub struct RpcRouter {
    state: Mutex<RouterState>,
}

impl RpcRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // State stays consistent across a panic in another holder; keep serving.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attach a connection; forwarded calls are delivered on `sender`.
    ///
    /// Returns the generation assigned to the connection.
    pub fn connect(
        &self,
        connection: ConnectionId,
        sender: mpsc::UnboundedSender<RpcRequest>,
    ) -> u64 {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .connections
            .insert(connection, ConnectionEntry { generation, sender });
        tracing::debug!(%connection, generation, "rpc connection attached");
        generation
    }

    /// Detach a connection, drop its methods and fail its in-flight calls.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.lock();
        state.connections.remove(&connection);
        state.methods.retain(|_, owner| owner.connection != connection);

        let orphaned: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, call)| call.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in &orphaned {
            if let Some(call) = state.pending.remove(request_id) {
                let _ = call.reply.send(Err(RpcError::OwnerDisconnected(call.method)));
            }
        }
        tracing::debug!(%connection, failed_calls = orphaned.len(), "rpc connection detached");
    }

    /// Make `connection` the owner of the scoped `method`.
    ///
    /// # Errors
    /// Returns error if the connection is not attached or a newer connection
    /// already owns the method.
    pub fn register(&self, connection: ConnectionId, method: &str) -> Result<(), RpcError> {
        let mut state = self.lock();
        let generation = state
            .connections
            .get(&connection)
            .map(|c| c.generation)
            .ok_or(RpcError::UnknownConnection(connection))?;

        if let Some(owner) = state.methods.get(method) {
            if owner.generation > generation {
                tracing::warn!(
                    %connection,
                    method,
                    owner = %owner.connection,
                    "rejecting registration from an older connection"
                );
                return Err(RpcError::StaleRegistration {
                    method: method.to_string(),
                });
            }
            if owner.connection != connection {
                tracing::debug!(method, previous = %owner.connection, "rpc method superseded");
            }
        }

        state.methods.insert(
            method.to_string(),
            MethodOwner {
                connection,
                generation,
            },
        );
        tracing::debug!(%connection, method, "rpc method registered");
        Ok(())
    }

    /// Remove `method` if `connection` currently owns it.
    pub fn unregister(&self, connection: ConnectionId, method: &str) -> bool {
        let mut state = self.lock();
        let owned = state
            .methods
            .get(method)
            .is_some_and(|owner| owner.connection == connection);
        if owned {
            state.methods.remove(method);
        }
        owned
    }

    /// Connection currently serving `method`.
    #[must_use]
    pub fn owner_of(&self, method: &str) -> Option<ConnectionId> {
        self.lock().methods.get(method).map(|owner| owner.connection)
    }

    /// Methods owned by `connection`, sorted.
    #[must_use]
    pub fn methods_for(&self, connection: ConnectionId) -> Vec<String> {
        let mut methods: Vec<String> = self
            .lock()
            .methods
            .iter()
            .filter(|(_, owner)| owner.connection == connection)
            .map(|(name, _)| name.clone())
            .collect();
        methods.sort();
        methods
    }

    /// Forward a call to the owner of `method` and wait for its reply.
    ///
    /// # Errors
    /// - `MethodNotFound` immediately when nobody serves `method`
    /// - `OwnerDisconnected` when the owner goes away before replying
    /// - `Timeout` when no reply arrives within `timeout`
    pub async fn call(
        &self,
        method: &str,
        params: String,
        timeout: Duration,
    ) -> Result<String, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut state = self.lock();
            let connection = state
                .methods
                .get(method)
                .map(|owner| owner.connection)
                .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
            let sender = state
                .connections
                .get(&connection)
                .map(|c| c.sender.clone())
                .ok_or_else(|| RpcError::OwnerDisconnected(method.to_string()))?;

            let request = RpcRequest {
                request_id: request_id.clone(),
                method: method.to_string(),
                params,
            };
            if sender.send(request).is_err() {
                return Err(RpcError::OwnerDisconnected(method.to_string()));
            }
            state.pending.insert(
                request_id.clone(),
                PendingCall {
                    connection,
                    method: method.to_string(),
                    reply: reply_tx,
                },
            );
        }

        let _pending = PendingGuard {
            router: self,
            request_id: &request_id,
        };
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::OwnerDisconnected(method.to_string())),
            Err(_) => {
                tracing::debug!(method, ?timeout, "rpc call timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Deliver the reply for `request_id` sent by `connection`.
    ///
    /// Returns false when no matching call is waiting, e.g. it already timed out.
    pub fn complete(&self, connection: ConnectionId, request_id: &str, result: String) -> bool {
        let mut state = self.lock();
        let matches = state
            .pending
            .get(request_id)
            .is_some_and(|call| call.connection == connection);
        if !matches {
            tracing::debug!(%connection, request_id, "dropping unmatched rpc response");
            return false;
        }
        state
            .pending
            .remove(request_id)
            .is_some_and(|call| call.reply.send(Ok(result)).is_ok())
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.lock().pending.len()
    }
}
