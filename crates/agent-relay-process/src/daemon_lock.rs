//! One daemon per host.
//!
//! The lock is a create-exclusive file holding the owner's PID as plain
//! text. A lock whose PID is no longer running is reclaimed on the spot.

use std::{path::Path, time::Duration};

use tracing::{debug, info};

use crate::{
    error::{ProcessError, io_err},
    lockfile::{LockFile, file_age, read_optional, remove_if_exists},
    pid::{current_pid, is_process_alive},
};

/// Retry policy for [`acquire_daemon_lock`].
#[derive(Debug, Clone)]
pub struct DaemonLockOptions {
    /// Contended attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first contended attempt; grows linearly.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Immediate retries per acquisition after reclaiming a stale lock or
    /// losing a lock that vanished mid-check; these do not use up attempts.
    pub max_reclaims: u32,
    /// A lock file without a readable PID counts as stale after this long.
    pub unreadable_stale_after: Duration,
}

impl Default for DaemonLockOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            max_reclaims: 3,
            unreadable_stale_after: Duration::from_secs(10),
        }
    }
}

impl DaemonLockOptions {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

/// Held daemon lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct DaemonLock {
    file: LockFile,
}

impl DaemonLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// # Errors
    /// Returns error if the lock file cannot be removed.
    pub fn release(self) -> Result<(), ProcessError> {
        self.file.release()
    }
}

/// Who holds the lock right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Gone,
    Alive(u32),
    Dead(u32),
    /// No parseable PID; judged by file age.
    Unreadable { stale: bool },
}

fn inspect(path: &Path, options: &DaemonLockOptions) -> Result<Holder, ProcessError> {
    let Some(contents) = read_optional(path).map_err(|e| io_err(path, e))? else {
        return Ok(Holder::Gone);
    };
    if let Ok(pid) = contents.trim().parse::<u32>() {
        return Ok(if is_process_alive(pid) {
            Holder::Alive(pid)
        } else {
            Holder::Dead(pid)
        });
    }
    let stale = file_age(path)
        .map_err(|e| io_err(path, e))?
        .is_some_and(|age| age > options.unreadable_stale_after);
    Ok(Holder::Unreadable { stale })
}

/// Try to become the host's daemon.
///
/// Returns `Ok(None)` when another live process keeps the lock through all
/// attempts. Waiting happens on the tokio timer, so dropping the future
/// cancels the acquisition.
///
/// # Errors
/// Returns error on filesystem failures other than contention.
pub async fn acquire_daemon_lock(
    path: &Path,
    options: &DaemonLockOptions,
) -> Result<Option<DaemonLock>, ProcessError> {
    let token = current_pid().to_string();
    let mut attempt = 0;
    let mut reclaims = 0;

    loop {
        if let Some(file) = LockFile::try_acquire(path, token.clone())? {
            debug!(path = %path.display(), attempt, "daemon lock acquired");
            return Ok(Some(DaemonLock { file }));
        }

        let holder = inspect(path, options)?;
        let reclaimable = matches!(holder, Holder::Dead(_) | Holder::Unreadable { stale: true });
        if (reclaimable || holder == Holder::Gone) && reclaims < options.max_reclaims {
            reclaims += 1;
            // re-check right before removal to narrow the window against a
            // racing reclaimer that already took a fresh lock
            if reclaimable && inspect(path, options)? == holder {
                remove_if_exists(path).map_err(|e| io_err(path, e))?;
                info!(path = %path.display(), ?holder, "reclaimed stale daemon lock");
            }
            continue;
        }

        attempt += 1;
        if attempt >= options.max_attempts {
            debug!(path = %path.display(), ?holder, attempts = attempt, "daemon lock not acquired");
            return Ok(None);
        }
        tokio::time::sleep(options.delay_after(attempt)).await;
    }
}
