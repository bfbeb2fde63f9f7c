//! Schema creation and the startup version guard.

use agent_relay_core::StoreError;
use sqlx::{Row, SqlitePool};

use super::db_err;

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    tag TEXT NOT NULL,
    namespace TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    metadata_version INTEGER NOT NULL DEFAULT 1,
    agent_state TEXT,
    agent_state_version INTEGER NOT NULL DEFAULT 1,
    todos TEXT,
    todos_updated_at INTEGER,
    active INTEGER NOT NULL DEFAULT 0,
    active_at INTEGER NOT NULL,
    seq INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_tag ON sessions(namespace, tag, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS machines (
    id TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    metadata_version INTEGER NOT NULL DEFAULT 1,
    daemon_state TEXT,
    daemon_state_version INTEGER NOT NULL DEFAULT 1,
    active INTEGER NOT NULL DEFAULT 0,
    active_at INTEGER NOT NULL,
    seq INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    local_id TEXT,
    seq INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (session_id, seq),
    UNIQUE (session_id, local_id)
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    platform TEXT NOT NULL,
    platform_user_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (platform, platform_user_id)
);

CREATE TABLE IF NOT EXISTS push_subscriptions (
    id TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    p256dh TEXT NOT NULL,
    auth TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (namespace, endpoint)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
";

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ? LIMIT 1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    Ok(row.is_some())
}

async fn stored_version(pool: &SqlitePool) -> Result<Option<i64>, StoreError> {
    if !table_exists(pool, "schema_version").await? {
        return Ok(None);
    }
    let row = sqlx::query("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    Ok(row.map(|r| r.get::<i64, _>("version")))
}

/// Create the schema on first use and refuse to run against a different version.
///
/// A database that has tables but no version marker predates the marker and
/// is stamped as compatible; that is the only upgrade performed.
pub(crate) async fn ensure_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    match stored_version(pool).await? {
        Some(found) if found != SCHEMA_VERSION => {
            tracing::error!(
                expected = SCHEMA_VERSION,
                found,
                "database schema version mismatch"
            );
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found,
            });
        }
        Some(_) => return Ok(()),
        None => {}
    }

    if table_exists(pool, "sessions").await? {
        tracing::info!(
            version = SCHEMA_VERSION,
            "existing database has no schema marker, stamping as compatible"
        );
    } else {
        tracing::info!(version = SCHEMA_VERSION, "creating database schema");
    }

    let mut tx = pool.begin().await.map_err(db_err)?;
    sqlx::raw_sql(CREATE_TABLES)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;
    Ok(())
}
