//! Entry point bundling the host paths with lock policies.

use crate::{
    credentials::{self, Credentials},
    daemon_lock::{DaemonLock, DaemonLockOptions, acquire_daemon_lock},
    daemon_state::{self, DaemonState},
    error::ProcessError,
    paths::RelayPaths,
    settings::{self, Settings, SettingsLockOptions},
};

/// Host-local coordination between relay processes.
#[derive(Debug, Clone)]
pub struct ProcessCoordinator {
    paths: RelayPaths,
    daemon_lock: DaemonLockOptions,
    settings_lock: SettingsLockOptions,
}

impl ProcessCoordinator {
    #[must_use]
    pub fn new(paths: RelayPaths) -> Self {
        Self {
            paths,
            daemon_lock: DaemonLockOptions::default(),
            settings_lock: SettingsLockOptions::default(),
        }
    }

    /// Coordinator rooted at [`RelayPaths::from_env`].
    ///
    /// # Errors
    /// Returns error if no home directory can be determined.
    pub fn from_env() -> Result<Self, ProcessError> {
        RelayPaths::from_env().map(Self::new)
    }

    #[must_use]
    pub fn with_daemon_lock_options(mut self, options: DaemonLockOptions) -> Self {
        self.daemon_lock = options;
        self
    }

    #[must_use]
    pub fn with_settings_lock_options(mut self, options: SettingsLockOptions) -> Self {
        self.settings_lock = options;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &RelayPaths {
        &self.paths
    }

    /// `None` means another live daemon kept the lock.
    ///
    /// # Errors
    /// Returns error on filesystem failures.
    pub async fn acquire_daemon_lock(&self) -> Result<Option<DaemonLock>, ProcessError> {
        acquire_daemon_lock(&self.paths.daemon_lock_file(), &self.daemon_lock).await
    }

    /// # Errors
    /// Returns error if the settings file is unreadable.
    pub fn read_settings(&self) -> Result<Settings, ProcessError> {
        settings::read_settings(&self.paths)
    }

    /// `Ok(None)` means the settings lock was not acquired.
    ///
    /// # Errors
    /// Returns error on filesystem or parse failures.
    pub async fn update_settings<F>(&self, update: F) -> Result<Option<Settings>, ProcessError>
    where
        F: FnOnce(Settings) -> Settings,
    {
        settings::update_settings(&self.paths, &self.settings_lock, update).await
    }

    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn write_daemon_state(&self, state: &DaemonState) -> Result<(), ProcessError> {
        daemon_state::write_daemon_state(&self.paths, state)
    }

    /// # Errors
    /// Returns error if the file exists but cannot be read.
    pub fn read_daemon_state(&self) -> Result<Option<DaemonState>, ProcessError> {
        daemon_state::read_daemon_state(&self.paths)
    }

    /// # Errors
    /// Returns error if the file cannot be removed.
    pub fn clear_daemon_state(&self) -> Result<(), ProcessError> {
        daemon_state::clear_daemon_state(&self.paths)
    }

    /// # Errors
    /// Returns error if the state file exists but cannot be read.
    pub fn running_daemon(&self, version: &str) -> Result<Option<DaemonState>, ProcessError> {
        daemon_state::running_daemon(&self.paths, version)
    }

    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn read_credentials(&self) -> Result<Option<Credentials>, ProcessError> {
        credentials::read_credentials(&self.paths)
    }

    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn write_credentials(&self, credentials: &Credentials) -> Result<(), ProcessError> {
        credentials::write_credentials(&self.paths, credentials)
    }

    /// # Errors
    /// Returns error if the file cannot be removed.
    pub fn clear_credentials(&self) -> Result<(), ProcessError> {
        credentials::clear_credentials(&self.paths)
    }
}
