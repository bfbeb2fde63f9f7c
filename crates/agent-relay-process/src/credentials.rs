//! Credentials file, readable only by its owner.

use serde::{Deserialize, Serialize};

use crate::{
    error::{ProcessError, io_err},
    lockfile::{read_optional, remove_if_exists, write_atomic},
    paths::RelayPaths,
};

const OWNER_ONLY: u32 = 0o600;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// # Errors
/// Returns error if the file exists but cannot be read or parsed.
pub fn read_credentials(paths: &RelayPaths) -> Result<Option<Credentials>, ProcessError> {
    let path = paths.credentials_file();
    match read_optional(&path).map_err(|e| io_err(&path, e))? {
        Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        None => Ok(None),
    }
}

/// # Errors
/// Returns error if the file cannot be written.
pub fn write_credentials(
    paths: &RelayPaths,
    credentials: &Credentials,
) -> Result<(), ProcessError> {
    let bytes = serde_json::to_vec_pretty(credentials)?;
    write_atomic(&paths.credentials_file(), &bytes, Some(OWNER_ONLY))
}

/// # Errors
/// Returns error if an existing file cannot be removed.
pub fn clear_credentials(paths: &RelayPaths) -> Result<(), ProcessError> {
    let path = paths.credentials_file();
    remove_if_exists(&path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
