//! Persisted entities shared by the store, the sync engine and the wire protocol.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session identifier.
pub type SessionId = String;

/// Machine identifier.
pub type MachineId = String;

/// Namespace used when a caller does not supply one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Current wall-clock time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Generate a fresh entity identifier.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A remote agent session.
///
/// `metadata` and `agent_state` are opaque to the store; each carries its own
/// version counter that starts at 1 and advances by exactly one per accepted
/// write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    /// Idempotency key supplied by the creator.
    pub tag: String,
    pub namespace: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: Value,
    pub metadata_version: i64,
    pub agent_state: Option<Value>,
    pub agent_state_version: i64,
    pub todos: Option<Value>,
    pub todos_updated_at: Option<i64>,
    pub active: bool,
    pub active_at: i64,
    pub seq: i64,
    /// Runtime-only; never persisted.
    #[serde(default)]
    pub thinking: bool,
}

/// A host running the agent daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    pub namespace: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata: Value,
    pub metadata_version: i64,
    pub daemon_state: Option<Value>,
    pub daemon_state_version: i64,
    pub active: bool,
    pub active_at: i64,
    pub seq: i64,
}

/// An entry in a session's append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: SessionId,
    pub content: Value,
    pub created_at: i64,
    /// Strictly increasing per session, starting at 1.
    pub seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

/// A user identity bound to an external platform account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub platform: String,
    pub platform_user_id: String,
    pub namespace: String,
    pub created_at: i64,
}

/// Key material of a web-push subscription, persisted as supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A push endpoint registered for a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub id: String,
    pub namespace: String,
    pub endpoint: String,
    pub keys: PushKeys,
    pub created_at: i64,
}
