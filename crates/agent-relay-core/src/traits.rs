//! Storage contract for durable session and machine state.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{
    envelope::CasOutcome,
    types::{Machine, Message, PushKeys, PushSubscription, Session, User},
};

/// Largest page `get_messages` will return.
pub const MAX_MESSAGE_PAGE: i64 = 200;

/// Clamp a requested page size to `1..=MAX_MESSAGE_PAGE`.
#[must_use]
pub fn clamp_page(limit: i64) -> i64 {
    limit.clamp(1, MAX_MESSAGE_PAGE)
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(
        "Database schema version {found} does not match the version this build expects \
         ({expected}); refusing to start. Migrate or restore the database before restarting."
    )]
    SchemaMismatch { expected: i64, found: i64 },
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable store with optimistic-concurrency updates.
///
/// Every `update_*` applies only when the stored version equals
/// `expected_version`. A stale version is not an error: it yields
/// [`CasOutcome::Mismatch`] carrying the current stored version and value.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    // --- sessions ---

    /// Return the most recent session for `(tag, namespace)`, creating it if absent.
    async fn get_or_create_session(
        &self,
        tag: &str,
        metadata: Value,
        agent_state: Option<Value>,
        namespace: &str,
    ) -> Result<Session, StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// List sessions, most recently updated first.
    async fn list_sessions(&self, namespace: Option<&str>) -> Result<Vec<Session>, StoreError>;

    async fn update_session_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError>;

    async fn update_session_agent_state(
        &self,
        id: &str,
        agent_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError>;

    /// Replace the todo snapshot if `updated_at` is newer than the stored one.
    ///
    /// Returns whether the snapshot was written.
    async fn set_session_todos(
        &self,
        id: &str,
        todos: Value,
        updated_at: i64,
        namespace: &str,
    ) -> Result<bool, StoreError>;

    /// Persist a liveness transition.
    async fn set_session_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError>;

    /// Delete a session and its messages. Returns whether a row was removed.
    async fn delete_session(&self, id: &str, namespace: &str) -> Result<bool, StoreError>;

    // --- machines ---

    async fn get_or_create_machine(
        &self,
        id: &str,
        metadata: Value,
        daemon_state: Option<Value>,
        namespace: &str,
    ) -> Result<Machine, StoreError>;

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError>;

    async fn list_machines(&self, namespace: Option<&str>) -> Result<Vec<Machine>, StoreError>;

    async fn update_machine_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError>;

    async fn update_machine_daemon_state(
        &self,
        id: &str,
        daemon_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError>;

    async fn set_machine_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError>;

    // --- messages ---

    /// Append a message. With a `local_id` already seen for this session the
    /// original row is returned and no sequence number is consumed.
    async fn add_message(
        &self,
        session_id: &str,
        content: Value,
        local_id: Option<&str>,
    ) -> Result<Message, StoreError>;

    /// Up to `limit` messages in ascending `seq`, restricted to
    /// `seq < before_seq` when a cursor is given.
    async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<Message>, StoreError>;

    /// Up to `limit` messages with `seq > after_seq`, ascending.
    async fn get_messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    // --- users & push ---

    async fn get_or_create_user(
        &self,
        platform: &str,
        platform_user_id: &str,
        namespace: &str,
    ) -> Result<User, StoreError>;

    async fn get_user(
        &self,
        platform: &str,
        platform_user_id: &str,
    ) -> Result<Option<User>, StoreError>;

    /// Insert or refresh the subscription for `(namespace, endpoint)`.
    async fn add_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
        keys: PushKeys,
    ) -> Result<PushSubscription, StoreError>;

    async fn remove_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError>;

    async fn list_push_subscriptions(
        &self,
        namespace: &str,
    ) -> Result<Vec<PushSubscription>, StoreError>;
}
