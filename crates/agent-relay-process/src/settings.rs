//! Host settings document shared by every relay process on the machine.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{ProcessError, io_err},
    lockfile::{LockFile, file_age, read_optional, remove_if_exists, write_atomic},
    paths::RelayPaths,
    pid::current_pid,
};

/// Settings document. Fields this version does not know are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Retry policy for the settings lock.
#[derive(Debug, Clone)]
pub struct SettingsLockOptions {
    /// A lock older than this is cleared as abandoned.
    pub stale_after: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for SettingsLockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10),
            retry_delay: Duration::from_millis(50),
            max_attempts: 200,
        }
    }
}

/// Current settings; a missing file yields the defaults.
///
/// # Errors
/// Returns error if the file exists but cannot be read or parsed.
pub fn read_settings(paths: &RelayPaths) -> Result<Settings, ProcessError> {
    let path = paths.settings_file();
    match read_optional(&path).map_err(|e| io_err(&path, e))? {
        Some(contents) if !contents.trim().is_empty() => Ok(serde_json::from_str(&contents)?),
        _ => Ok(Settings::default()),
    }
}

async fn acquire_settings_lock(
    path: &Path,
    options: &SettingsLockOptions,
) -> Result<Option<LockFile>, ProcessError> {
    let token = format!("{}:{}", current_pid(), Uuid::new_v4());
    for attempt in 1..=options.max_attempts {
        if let Some(lock) = LockFile::try_acquire(path, token.clone())? {
            return Ok(Some(lock));
        }
        let age = file_age(path).map_err(|e| io_err(path, e))?;
        if age.is_some_and(|age| age > options.stale_after) {
            remove_if_exists(path).map_err(|e| io_err(path, e))?;
            info!(path = %path.display(), ?age, "cleared stale settings lock");
            continue;
        }
        if attempt < options.max_attempts {
            tokio::time::sleep(options.retry_delay).await;
        }
    }
    debug!(path = %path.display(), "settings lock not acquired");
    Ok(None)
}

/// Read, modify and write the settings under the settings lock.
///
/// Returns the written settings, or `None` if the lock could not be taken.
///
/// # Errors
/// Returns error if the settings cannot be read, parsed or written.
pub async fn update_settings<F>(
    paths: &RelayPaths,
    options: &SettingsLockOptions,
    update: F,
) -> Result<Option<Settings>, ProcessError>
where
    F: FnOnce(Settings) -> Settings,
{
    let Some(lock) = acquire_settings_lock(&paths.settings_lock(), options).await? else {
        return Ok(None);
    };

    let updated = update(read_settings(paths)?);
    let bytes = serde_json::to_vec_pretty(&updated)?;
    write_atomic(&paths.settings_file(), &bytes, None)?;

    lock.release()?;
    Ok(Some(updated))
}
