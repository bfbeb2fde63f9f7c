//! Coordinator WebSocket endpoint.
//!
//! Each socket becomes one router connection: methods it announces are
//! routed to it until it disconnects, and forwarded calls are written to it
//! as `rpc-request` frames.

use agent_relay_core::{StoreError, SyncEvent, types::DEFAULT_NAMESPACE};
use agent_relay_rpc::{ConnectionId, RpcRequest, method_scope};
use agent_relay_sync::{SyncEngine, SyncError};
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerMessage};

/// Shared handler state.
#[derive(Clone)]
pub struct RelayState {
    pub engine: SyncEngine,
}

/// Query parameters accepted on `/ws`.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Stream sync events to this connection.
    #[serde(default)]
    pub subscribe: bool,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Router serving `/ws` and `/health`.
#[must_use]
pub fn relay_router(engine: SyncEngine) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(RelayState { engine })
}

async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: RelayState, params: ConnectParams) {
    let connection = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let (rpc_tx, rpc_rx) = mpsc::unbounded_channel::<RpcRequest>();
    state.engine.router().connect(connection, rpc_tx);
    let rpc_task = tokio::spawn(forward_rpc_requests(rpc_rx, tx.clone()));

    let event_task = params.subscribe.then(|| {
        tokio::spawn(forward_events(
            state.engine.subscribe(),
            params.namespace.clone(),
            tx.clone(),
        ))
    });

    tracing::info!(%connection, namespace = %params.namespace, "relay connection opened");

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(%connection, "WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%connection, "Invalid client message: {e}");
                let _ = tx.send(ServerMessage::error(format!("Invalid message: {e}")));
                continue;
            }
        };

        dispatch(&state.engine, connection, &params.namespace, client_msg, &tx).await;
    }

    state.engine.router().disconnect(connection);
    rpc_task.abort();
    if let Some(task) = event_task {
        task.abort();
    }
    send_task.abort();
    tracing::info!(%connection, "relay connection closed");
}

async fn forward_rpc_requests(
    mut requests: mpsc::UnboundedReceiver<RpcRequest>,
    tx: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(request) = requests.recv().await {
        let frame = ServerMessage::RpcRequest {
            request_id: request.request_id,
            method: request.method,
            params: request.params,
        };
        if tx.send(frame).is_err() {
            break;
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<SyncEvent>,
    namespace: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !visible_in(&event, &namespace) {
                    continue;
                }
                if tx.send(ServerMessage::Update { event }).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "viewer lagged behind sync events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Events for entities of another namespace are withheld.
fn visible_in(event: &SyncEvent, namespace: &str) -> bool {
    event.namespace() == namespace
}

/// Succeeds only if `id` names a session or machine in `namespace`.
///
/// Entities of other namespaces are reported as not found.
async fn ensure_in_namespace(
    engine: &SyncEngine,
    id: &str,
    namespace: &str,
) -> Result<(), SyncError> {
    match engine.entity_namespace(id).await? {
        Some(owner) if owner == namespace => Ok(()),
        _ => Err(StoreError::NotFound(id.to_string()).into()),
    }
}

/// Like [`ensure_in_namespace`] for the owner of a scoped method.
async fn ensure_method_in_namespace(
    engine: &SyncEngine,
    method: &str,
    namespace: &str,
) -> Result<(), SyncError> {
    let owner = method_scope(method).ok_or_else(|| StoreError::NotFound(method.to_string()))?;
    ensure_in_namespace(engine, owner, namespace).await
}

fn ack(tx: &mpsc::UnboundedSender<ServerMessage>, ack_id: String, result: Value) {
    let _ = tx.send(ServerMessage::Ack { ack_id, result });
}

/// Ack an optional `ack_id` with a value or an `{"error": ...}` payload.
fn reply(
    tx: &mpsc::UnboundedSender<ServerMessage>,
    ack_id: Option<String>,
    result: Result<Value, &SyncError>,
) {
    let result = result.unwrap_or_else(|e| {
        tracing::debug!("request failed: {e}");
        json!({ "error": e.to_string() })
    });
    if let Some(ack_id) = ack_id {
        ack(tx, ack_id, result);
    }
}

/// Report a frame that has no ack of its own and failed.
fn rejected(tx: &mpsc::UnboundedSender<ServerMessage>, what: &str, result: Result<(), SyncError>) {
    if let Err(e) = result {
        tracing::debug!("{what} rejected: {e}");
        let _ = tx.send(ServerMessage::error(format!("{what} rejected: {e}")));
    }
}

async fn forward_call(
    engine: &SyncEngine,
    method: &str,
    params: &Value,
    namespace: &str,
) -> Result<Value, SyncError> {
    ensure_method_in_namespace(engine, method, namespace).await?;
    let raw = engine
        .router()
        .call(method, serde_json::to_string(params)?, engine.config().rpc_timeout)
        .await?;
    Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

async fn dispatch(
    engine: &SyncEngine,
    connection: ConnectionId,
    namespace: &str,
    msg: ClientMessage,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match msg {
        ClientMessage::CreateSession {
            ack_id,
            tag,
            metadata,
            agent_state,
        } => {
            let result = engine
                .get_or_create_session(&tag, metadata, agent_state, namespace)
                .await;
            reply(tx, ack_id, result.as_ref().map(to_value));
        }
        ClientMessage::CreateMachine {
            ack_id,
            machine_id,
            metadata,
            daemon_state,
        } => {
            let result = engine
                .get_or_create_machine(&machine_id, metadata, daemon_state, namespace)
                .await;
            reply(tx, ack_id, result.as_ref().map(to_value));
        }
        ClientMessage::SessionAlive(alive) => {
            let result = match ensure_in_namespace(engine, &alive.sid, namespace).await {
                Ok(()) => engine.handle_session_alive(alive).await,
                Err(e) => Err(e),
            };
            rejected(tx, "session heartbeat", result);
        }
        ClientMessage::SessionEnd(end) => {
            let result = match ensure_in_namespace(engine, &end.sid, namespace).await {
                Ok(()) => engine.handle_session_end(end).await,
                Err(e) => Err(e),
            };
            rejected(tx, "session end", result);
        }
        ClientMessage::MachineAlive(alive) => {
            let result = match ensure_in_namespace(engine, &alive.machine_id, namespace).await {
                Ok(()) => engine.handle_machine_alive(alive).await,
                Err(e) => Err(e),
            };
            rejected(tx, "machine heartbeat", result);
        }
        ClientMessage::UpdateMetadata {
            ack_id,
            sid,
            metadata,
            expected_version,
        } => {
            let envelope = engine
                .update_session_metadata(&sid, metadata, expected_version, namespace)
                .await;
            ack(tx, ack_id, to_value(&envelope));
        }
        ClientMessage::UpdateState {
            ack_id,
            sid,
            agent_state,
            expected_version,
        } => {
            let envelope = engine
                .update_session_agent_state(&sid, agent_state, expected_version, namespace)
                .await;
            ack(tx, ack_id, to_value(&envelope));
        }
        ClientMessage::MachineUpdateMetadata {
            ack_id,
            machine_id,
            metadata,
            expected_version,
        } => {
            let envelope = engine
                .update_machine_metadata(&machine_id, metadata, expected_version, namespace)
                .await;
            ack(tx, ack_id, to_value(&envelope));
        }
        ClientMessage::MachineUpdateState {
            ack_id,
            machine_id,
            daemon_state,
            expected_version,
        } => {
            let envelope = engine
                .update_machine_daemon_state(&machine_id, daemon_state, expected_version, namespace)
                .await;
            ack(tx, ack_id, to_value(&envelope));
        }
        ClientMessage::Message {
            ack_id,
            sid,
            content,
            local_id,
        } => {
            let result = match ensure_in_namespace(engine, &sid, namespace).await {
                Ok(()) => engine.add_message(&sid, content, local_id.as_deref()).await,
                Err(e) => Err(e),
            };
            reply(tx, ack_id, result.as_ref().map(to_value));
        }
        ClientMessage::RpcRegister { method } => {
            if let Err(e) = ensure_method_in_namespace(engine, &method, namespace).await {
                let _ = tx.send(ServerMessage::error(e.to_string()));
                return;
            }
            match engine.router().register(connection, &method) {
                Ok(()) => {
                    let _ = tx.send(ServerMessage::RpcRegistered { method });
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.to_string()));
                }
            }
        }
        ClientMessage::RpcUnregister { method } => {
            engine.router().unregister(connection, &method);
        }
        ClientMessage::RpcCall {
            ack_id,
            method,
            params,
        } => {
            // Detached: the reply may come back through this connection's read loop.
            let engine = engine.clone();
            let namespace = namespace.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match forward_call(&engine, &method, &params, &namespace).await {
                    Ok(value) => value,
                    Err(e) => json!({ "error": e.to_string() }),
                };
                ack(&tx, ack_id, result);
            });
        }
        ClientMessage::RpcResponse { request_id, result } => {
            engine.router().complete(connection, &request_id, result);
        }
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}
