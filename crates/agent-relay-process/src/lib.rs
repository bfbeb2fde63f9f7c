//! Host-local coordination between relay processes.
//!
//! Provides:
//! - Daemon lock (one daemon per host, stale PID reclaim)
//! - Settings document under its own short-lived lock, written atomically
//! - Daemon state file for lock-free "is a daemon running" checks
//! - Owner-only credentials file

pub mod coordinator;
pub mod credentials;
pub mod daemon_lock;
pub mod daemon_state;
pub mod error;
mod lockfile;
pub mod paths;
pub mod pid;
pub mod settings;

pub use coordinator::ProcessCoordinator;
pub use credentials::Credentials;
pub use daemon_lock::{DaemonLock, DaemonLockOptions, acquire_daemon_lock};
pub use daemon_state::DaemonState;
pub use error::ProcessError;
pub use paths::RelayPaths;
pub use pid::is_process_alive;
pub use settings::{Settings, SettingsLockOptions};
