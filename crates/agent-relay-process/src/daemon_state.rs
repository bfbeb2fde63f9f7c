//! Daemon state file: a cheap, lock-free answer to "is a daemon running?".

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{ProcessError, io_err},
    lockfile::{read_optional, remove_if_exists, write_atomic},
    paths::RelayPaths,
    pid::is_process_alive,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    pub pid: u32,
    pub http_port: u16,
    /// Unix epoch milliseconds.
    pub start_time: i64,
    pub started_with_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Write the state file. Not guarded by any lock.
///
/// # Errors
/// Returns error if the file cannot be written.
pub fn write_daemon_state(paths: &RelayPaths, state: &DaemonState) -> Result<(), ProcessError> {
    let bytes = serde_json::to_vec_pretty(state)?;
    write_atomic(&paths.daemon_state_file(), &bytes, None)
}

/// The recorded state; `None` when absent or unreadable.
///
/// # Errors
/// Returns error only if the file exists but cannot be read.
pub fn read_daemon_state(paths: &RelayPaths) -> Result<Option<DaemonState>, ProcessError> {
    let path = paths.daemon_state_file();
    let Some(contents) = read_optional(&path).map_err(|e| io_err(&path, e))? else {
        return Ok(None);
    };
    match serde_json::from_str(&contents) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt daemon state");
            Ok(None)
        }
    }
}

/// # Errors
/// Returns error if an existing file cannot be removed.
pub fn clear_daemon_state(paths: &RelayPaths) -> Result<(), ProcessError> {
    let path = paths.daemon_state_file();
    remove_if_exists(&path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// A live daemon started with `version`, if the state file names one.
///
/// # Errors
/// Returns error if the state file exists but cannot be read.
pub fn running_daemon(
    paths: &RelayPaths,
    version: &str,
) -> Result<Option<DaemonState>, ProcessError> {
    Ok(read_daemon_state(paths)?
        .filter(|state| state.started_with_version == version && is_process_alive(state.pid)))
}
