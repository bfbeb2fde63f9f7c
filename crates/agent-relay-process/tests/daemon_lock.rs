//! Daemon lock contention, release and stale reclaim.

use std::{fs, time::Duration};

use agent_relay_process::{DaemonLockOptions, ProcessCoordinator, RelayPaths, acquire_daemon_lock};

fn fast() -> DaemonLockOptions {
    DaemonLockOptions {
        max_attempts: 5,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        ..DaemonLockOptions::default()
    }
}

#[cfg(unix)]
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[tokio::test]
async fn uncontended_lock_records_our_pid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.lock");

    let lock = acquire_daemon_lock(&path, &fast()).await.unwrap().unwrap();
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        std::process::id().to_string()
    );
    lock.release().unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn contended_lock_is_not_acquired_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.lock");
    let options = fast();

    let _held = acquire_daemon_lock(&path, &options).await.unwrap().unwrap();
    let started = std::time::Instant::now();
    let second = acquire_daemon_lock(&path, &options).await.unwrap();

    assert!(second.is_none());
    // four sleeps of 10, 20, 30 and 40ms between five attempts
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn released_lock_is_immediately_available() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.lock");
    let options = DaemonLockOptions {
        max_attempts: 1,
        ..fast()
    };

    let first = acquire_daemon_lock(&path, &options).await.unwrap().unwrap();
    assert!(acquire_daemon_lock(&path, &options).await.unwrap().is_none());

    drop(first);
    assert!(acquire_daemon_lock(&path, &options).await.unwrap().is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn dead_holder_is_reclaimed_without_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.lock");
    fs::write(&path, dead_pid().to_string()).unwrap();

    let options = DaemonLockOptions {
        max_attempts: 1,
        base_delay: Duration::from_secs(60),
        ..fast()
    };
    let lock = acquire_daemon_lock(&path, &options).await.unwrap();
    assert!(lock.is_some());
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        std::process::id().to_string()
    );
}

#[tokio::test]
async fn fresh_unreadable_lock_counts_as_held() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.lock");
    fs::write(&path, "").unwrap();

    let options = DaemonLockOptions {
        max_attempts: 2,
        ..fast()
    };
    assert!(acquire_daemon_lock(&path, &options).await.unwrap().is_none());

    let impatient = DaemonLockOptions {
        unreadable_stale_after: Duration::ZERO,
        ..options
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(acquire_daemon_lock(&path, &impatient).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_acquirers_get_one_lock() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = ProcessCoordinator::new(RelayPaths::new(dir.path()))
        .with_daemon_lock_options(DaemonLockOptions {
            max_attempts: 3,
            ..fast()
        });

    let (a, b) = tokio::join!(
        coordinator.acquire_daemon_lock(),
        coordinator.acquire_daemon_lock()
    );
    let held: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].path(), coordinator.paths().daemon_lock_file());
}
