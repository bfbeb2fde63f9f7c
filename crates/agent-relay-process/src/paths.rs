//! File layout under the relay home directory.

use std::path::{Path, PathBuf};

use crate::error::ProcessError;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "AGENT_RELAY_HOME";

pub const SETTINGS_FILE: &str = "settings.json";
pub const CREDENTIALS_FILE: &str = "access.key";
pub const DAEMON_STATE_FILE: &str = "daemon.state.json";
pub const DAEMON_LOCK_FILE: &str = "daemon.state.json.lock";
pub const LOGS_DIR: &str = "logs";

/// Where the relay keeps its host-local files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPaths {
    root: PathBuf,
}

impl RelayPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$AGENT_RELAY_HOME`, else `~/.agent-relay`.
    ///
    /// # Errors
    /// Returns error if neither is available.
    pub fn from_env() -> Result<Self, ProcessError> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(root));
        }
        dirs::home_dir()
            .map(|home| Self::new(home.join(".agent-relay")))
            .ok_or(ProcessError::NoHomeDir)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    /// Guards read-modify-write cycles on the settings file.
    #[must_use]
    pub fn settings_lock(&self) -> PathBuf {
        sibling(&self.settings_file(), ".lock")
    }

    #[must_use]
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    #[must_use]
    pub fn daemon_state_file(&self) -> PathBuf {
        self.root.join(DAEMON_STATE_FILE)
    }

    #[must_use]
    pub fn daemon_lock_file(&self) -> PathBuf {
        self.root.join(DAEMON_LOCK_FILE)
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = RelayPaths::new("/tmp/relay");
        assert_eq!(paths.settings_file(), PathBuf::from("/tmp/relay/settings.json"));
        assert_eq!(paths.settings_lock(), PathBuf::from("/tmp/relay/settings.json.lock"));
        assert_eq!(
            paths.daemon_lock_file(),
            PathBuf::from("/tmp/relay/daemon.state.json.lock")
        );
    }
}
