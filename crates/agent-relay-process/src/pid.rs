//! PID liveness probing.

/// PID of the current process.
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` exists.
///
/// A process we may not signal still counts as alive.
#[cfg(unix)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a signal probe every recorded holder is assumed alive.
#[cfg(not(unix))]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}
