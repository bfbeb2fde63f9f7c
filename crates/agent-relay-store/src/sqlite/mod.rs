//! SQLite store (feature-gated).

mod schema;

use std::{path::Path, str::FromStr, time::Duration};

use agent_relay_core::{
    CasOutcome, StoreError, VersionedStore,
    traits::clamp_page,
    types::{Machine, Message, PushKeys, PushSubscription, Session, User, new_id, now_millis},
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};

pub use schema::SCHEMA_VERSION;

const SESSION_COLUMNS: &str = "id, tag, namespace, created_at, updated_at, metadata, \
    metadata_version, agent_state, agent_state_version, todos, todos_updated_at, active, \
    active_at, seq";

const MACHINE_COLUMNS: &str = "id, namespace, created_at, updated_at, metadata, \
    metadata_version, daemon_state, daemon_state_version, active, active_at, seq";

const MESSAGE_COLUMNS: &str = "id, session_id, local_id, seq, content, created_at";

const USER_COLUMNS: &str = "id, platform, platform_user_id, namespace, created_at";

const PUSH_COLUMNS: &str = "id, namespace, endpoint, p256dh, auth, created_at";

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Connection settings for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// `sqlite:` URL of the database.
    pub url: String,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl SqliteStoreConfig {
    /// Database file at `path`, created if missing.
    #[must_use]
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite://{}", path.as_ref().display()),
            busy_timeout: Duration::from_secs(5),
            max_connections: 8,
        }
    }

    /// Private in-memory database, lost when the store is dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            busy_timeout: Duration::from_secs(5),
            // every connection to :memory: is a distinct database
            max_connections: 1,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Which versioned column pair a compare-and-swap targets.
#[derive(Debug, Clone, Copy)]
enum CasField {
    SessionMetadata,
    SessionAgentState,
    MachineMetadata,
    MachineDaemonState,
}

impl CasField {
    const fn table(self) -> &'static str {
        match self {
            Self::SessionMetadata | Self::SessionAgentState => "sessions",
            Self::MachineMetadata | Self::MachineDaemonState => "machines",
        }
    }

    const fn columns(self) -> (&'static str, &'static str) {
        match self {
            Self::SessionMetadata | Self::MachineMetadata => ("metadata", "metadata_version"),
            Self::SessionAgentState => ("agent_state", "agent_state_version"),
            Self::MachineDaemonState => ("daemon_state", "daemon_state_version"),
        }
    }
}

/// SQLite store implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database and run the schema guard.
    ///
    /// # Errors
    /// Returns error if the connection fails or the schema version on disk
    /// differs from [`SCHEMA_VERSION`].
    pub async fn connect(config: &SqliteStoreConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);
        if !config.is_in_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_in_memory() {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_err)?;

        schema::ensure_schema(&pool).await?;
        tracing::debug!(url = %config.url, "sqlite store ready");
        Ok(Self { pool })
    }

    /// Shortcut for [`SqliteStoreConfig::in_memory`].
    ///
    /// # Errors
    /// Returns error if the connection fails.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(&SqliteStoreConfig::in_memory()).await
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn cas_update(
        &self,
        field: CasField,
        id: &str,
        value: Option<&Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        let table = field.table();
        let (value_col, version_col) = field.columns();
        let encoded = value.map(serde_json::to_string).transpose()?;

        let result = sqlx::query(&format!(
            "UPDATE {table} SET {value_col} = ?, {version_col} = {version_col} + 1, \
             seq = seq + 1, updated_at = ? \
             WHERE id = ? AND namespace = ? AND {version_col} = ?"
        ))
        .bind(encoded)
        .bind(now_millis())
        .bind(id)
        .bind(namespace)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Applied {
                version: expected_version + 1,
                value: value.cloned(),
            });
        }

        let current = sqlx::query(&format!(
            "SELECT {value_col} AS value, {version_col} AS version FROM {table} \
             WHERE id = ? AND namespace = ?"
        ))
        .bind(id)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("{table} {id}")))?;

        let version: i64 = current.get("version");
        tracing::debug!(%id, table, expected_version, version, "version mismatch");
        Ok(CasOutcome::Mismatch {
            version,
            value: decode_opt(current.get("value"))?,
        })
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn fetch_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        sqlx::query(&format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(machine_from_row)
            .transpose()
    }
}

fn decode(raw: &str) -> Result<Value, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn decode_opt(raw: Option<String>) -> Result<Option<Value>, StoreError> {
    raw.as_deref().map(decode).transpose()
}

fn encode_opt(value: Option<&Value>) -> Result<Option<String>, StoreError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    Ok(Session {
        id: row.get("id"),
        tag: row.get("tag"),
        namespace: row.get("namespace"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        metadata: decode(row.get("metadata"))?,
        metadata_version: row.get("metadata_version"),
        agent_state: decode_opt(row.get("agent_state"))?,
        agent_state_version: row.get("agent_state_version"),
        todos: decode_opt(row.get("todos"))?,
        todos_updated_at: row.get("todos_updated_at"),
        active: row.get("active"),
        active_at: row.get("active_at"),
        seq: row.get("seq"),
        thinking: false,
    })
}

fn machine_from_row(row: &SqliteRow) -> Result<Machine, StoreError> {
    Ok(Machine {
        id: row.get("id"),
        namespace: row.get("namespace"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        metadata: decode(row.get("metadata"))?,
        metadata_version: row.get("metadata_version"),
        daemon_state: decode_opt(row.get("daemon_state"))?,
        daemon_state_version: row.get("daemon_state_version"),
        active: row.get("active"),
        active_at: row.get("active_at"),
        seq: row.get("seq"),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.get("id"),
        session_id: row.get("session_id"),
        content: decode(row.get("content"))?,
        created_at: row.get("created_at"),
        seq: row.get("seq"),
        local_id: row.get("local_id"),
    })
}

fn user_from_row(row: &SqliteRow) -> User {
    User {
        id: row.get("id"),
        platform: row.get("platform"),
        platform_user_id: row.get("platform_user_id"),
        namespace: row.get("namespace"),
        created_at: row.get("created_at"),
    }
}

fn push_from_row(row: &SqliteRow) -> PushSubscription {
    PushSubscription {
        id: row.get("id"),
        namespace: row.get("namespace"),
        endpoint: row.get("endpoint"),
        keys: PushKeys {
            p256dh: row.get("p256dh"),
            auth: row.get("auth"),
        },
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl VersionedStore for SqliteStore {
    async fn get_or_create_session(
        &self,
        tag: &str,
        metadata: Value,
        agent_state: Option<Value>,
        namespace: &str,
    ) -> Result<Session, StoreError> {
        let timestamp = now_millis();

        // Single statement so concurrent callers with the same tag cannot both insert.
        let result = sqlx::query(
            "INSERT INTO sessions (id, tag, namespace, created_at, updated_at, metadata, \
             metadata_version, agent_state, agent_state_version, active, active_at, seq) \
             SELECT ?1, ?2, ?3, ?4, ?4, ?5, 1, ?6, 1, 0, ?4, 0 \
             WHERE NOT EXISTS (SELECT 1 FROM sessions WHERE tag = ?2 AND namespace = ?3)",
        )
        .bind(new_id())
        .bind(tag)
        .bind(namespace)
        .bind(timestamp)
        .bind(serde_json::to_string(&metadata)?)
        .bind(encode_opt(agent_state.as_ref())?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            tracing::debug!(tag, namespace, "created session");
        }

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE tag = ? AND namespace = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(tag)
        .bind(namespace)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        session_from_row(&row)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.fetch_session(id).await
    }

    async fn list_sessions(&self, namespace: Option<&str>) -> Result<Vec<Session>, StoreError> {
        sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE (?1 IS NULL OR namespace = ?1) \
             ORDER BY updated_at DESC"
        ))
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(session_from_row)
        .collect()
    }

    async fn update_session_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError> {
        let outcome = self
            .cas_update(
                CasField::SessionMetadata,
                id,
                Some(&metadata),
                expected_version,
                namespace,
            )
            .await?;
        Ok(match outcome {
            CasOutcome::Applied { version, value } => CasOutcome::Applied {
                version,
                value: value.unwrap_or(Value::Null),
            },
            CasOutcome::Mismatch { version, value } => CasOutcome::Mismatch {
                version,
                value: value.unwrap_or(Value::Null),
            },
        })
    }

    async fn update_session_agent_state(
        &self,
        id: &str,
        agent_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        self.cas_update(
            CasField::SessionAgentState,
            id,
            agent_state.as_ref(),
            expected_version,
            namespace,
        )
        .await
    }

    async fn set_session_todos(
        &self,
        id: &str,
        todos: Value,
        updated_at: i64,
        namespace: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET todos = ?, todos_updated_at = ?, seq = seq + 1, updated_at = ? \
             WHERE id = ? AND namespace = ? \
             AND (todos_updated_at IS NULL OR todos_updated_at < ?)",
        )
        .bind(serde_json::to_string(&todos)?)
        .bind(updated_at)
        .bind(now_millis())
        .bind(id)
        .bind(namespace)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_session_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET active = ?, active_at = ? WHERE id = ?")
            .bind(active)
            .bind(active_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_session(&self, id: &str, namespace: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "DELETE FROM messages WHERE session_id = ?1 \
             AND EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND namespace = ?2)",
        )
        .bind(id)
        .bind(namespace)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ? AND namespace = ?")
            .bind(id)
            .bind(namespace)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_or_create_machine(
        &self,
        id: &str,
        metadata: Value,
        daemon_state: Option<Value>,
        namespace: &str,
    ) -> Result<Machine, StoreError> {
        let timestamp = now_millis();
        sqlx::query(
            "INSERT INTO machines (id, namespace, created_at, updated_at, metadata, \
             metadata_version, daemon_state, daemon_state_version, active, active_at, seq) \
             VALUES (?1, ?2, ?3, ?3, ?4, 1, ?5, 1, 0, ?3, 0) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(namespace)
        .bind(timestamp)
        .bind(serde_json::to_string(&metadata)?)
        .bind(encode_opt(daemon_state.as_ref())?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.fetch_machine(id)
            .await?
            .filter(|m| m.namespace == namespace)
            .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))
    }

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        self.fetch_machine(id).await
    }

    async fn list_machines(&self, namespace: Option<&str>) -> Result<Vec<Machine>, StoreError> {
        sqlx::query(&format!(
            "SELECT {MACHINE_COLUMNS} FROM machines WHERE (?1 IS NULL OR namespace = ?1) \
             ORDER BY updated_at DESC"
        ))
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(machine_from_row)
        .collect()
    }

    async fn update_machine_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError> {
        let outcome = self
            .cas_update(
                CasField::MachineMetadata,
                id,
                Some(&metadata),
                expected_version,
                namespace,
            )
            .await?;
        Ok(match outcome {
            CasOutcome::Applied { version, value } => CasOutcome::Applied {
                version,
                value: value.unwrap_or(Value::Null),
            },
            CasOutcome::Mismatch { version, value } => CasOutcome::Mismatch {
                version,
                value: value.unwrap_or(Value::Null),
            },
        })
    }

    async fn update_machine_daemon_state(
        &self,
        id: &str,
        daemon_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        self.cas_update(
            CasField::MachineDaemonState,
            id,
            daemon_state.as_ref(),
            expected_version,
            namespace,
        )
        .await
    }

    async fn set_machine_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE machines SET active = ?, active_at = ? WHERE id = ?")
            .bind(active)
            .bind(active_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn add_message(
        &self,
        session_id: &str,
        content: Value,
        local_id: Option<&str>,
    ) -> Result<Message, StoreError> {
        let id = new_id();
        let timestamp = now_millis();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Seq allocation and the local_id dedupe happen in one write statement;
        // the first statement of the transaction takes the write lock.
        let inserted = sqlx::query(
            "INSERT INTO messages (id, session_id, local_id, seq, content, created_at) \
             SELECT ?1, s.id, ?3, \
                 COALESCE((SELECT MAX(m.seq) FROM messages m WHERE m.session_id = s.id), 0) + 1, \
                 ?4, ?5 \
             FROM sessions s WHERE s.id = ?2 \
             ON CONFLICT(session_id, local_id) DO NOTHING",
        )
        .bind(&id)
        .bind(session_id)
        .bind(local_id)
        .bind(serde_json::to_string(&content)?)
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected()
            == 1;

        let row = if inserted {
            sqlx::query("UPDATE sessions SET seq = seq + 1, updated_at = ? WHERE id = ?")
                .bind(timestamp)
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
        } else if let Some(local_id) = local_id {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? AND local_id = ?"
            ))
            .bind(session_id)
            .bind(local_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
        } else {
            None
        };
        tx.commit().await.map_err(db_err)?;

        let row = row.ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        message_from_row(&row)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE session_id = ?1 AND (?2 IS NULL OR seq < ?2) \
                 ORDER BY seq DESC LIMIT ?3 \
             ) ORDER BY seq ASC"
        ))
        .bind(session_id)
        .bind(before_seq)
        .bind(clamp_page(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(message_from_row)
        .collect()
    }

    async fn get_messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? AND seq > ? \
             ORDER BY seq ASC LIMIT ?"
        ))
        .bind(session_id)
        .bind(after_seq)
        .bind(clamp_page(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(message_from_row)
        .collect()
    }

    async fn get_or_create_user(
        &self,
        platform: &str,
        platform_user_id: &str,
        namespace: &str,
    ) -> Result<User, StoreError> {
        sqlx::query(
            "INSERT INTO users (id, platform, platform_user_id, namespace, created_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(platform, platform_user_id) DO NOTHING",
        )
        .bind(new_id())
        .bind(platform)
        .bind(platform_user_id)
        .bind(namespace)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_user(platform, platform_user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {platform}/{platform_user_id}")))
    }

    async fn get_user(
        &self,
        platform: &str,
        platform_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE platform = ? AND platform_user_id = ?"
        ))
        .bind(platform)
        .bind(platform_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn add_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
        keys: PushKeys,
    ) -> Result<PushSubscription, StoreError> {
        sqlx::query(
            "INSERT INTO push_subscriptions (id, namespace, endpoint, p256dh, auth, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(namespace, endpoint) DO UPDATE SET \
                 p256dh = excluded.p256dh, auth = excluded.auth",
        )
        .bind(new_id())
        .bind(namespace)
        .bind(endpoint)
        .bind(&keys.p256dh)
        .bind(&keys.auth)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {PUSH_COLUMNS} FROM push_subscriptions WHERE namespace = ? AND endpoint = ?"
        ))
        .bind(namespace)
        .bind(endpoint)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(push_from_row(&row))
    }

    async fn remove_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM push_subscriptions WHERE namespace = ? AND endpoint = ?")
                .bind(namespace)
                .bind(endpoint)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_push_subscriptions(
        &self,
        namespace: &str,
    ) -> Result<Vec<PushSubscription>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PUSH_COLUMNS} FROM push_subscriptions WHERE namespace = ? \
             ORDER BY created_at ASC"
        ))
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(push_from_row).collect())
    }
}
