//! Heartbeat payloads and the pure rules the engine applies to them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Periodic "this session is running" signal from a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAlive {
    pub sid: String,
    /// Client timestamp, Unix epoch milliseconds.
    pub time: i64,
    #[serde(default)]
    pub thinking: bool,
}

/// A runner announcing that its session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnd {
    pub sid: String,
    pub time: i64,
}

/// Periodic "this machine's daemon is up" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineAlive {
    pub machine_id: String,
    pub time: i64,
}

/// Whether a heartbeat timestamp is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Accept,
    /// Timestamp lies ahead of the coordinator clock.
    Future,
    /// Timestamp is older than the accepted window.
    Stale,
}

#[must_use]
pub const fn check_heartbeat(time: i64, now: i64, max_age_ms: i64) -> HeartbeatVerdict {
    if time > now {
        HeartbeatVerdict::Future
    } else if now - time > max_age_ms {
        HeartbeatVerdict::Stale
    } else {
        HeartbeatVerdict::Accept
    }
}

/// An active entity whose last activity is more than `timeout_ms` ago.
#[must_use]
pub const fn is_expired(active_at: i64, now: i64, timeout_ms: i64) -> bool {
    now - active_at > timeout_ms
}

/// Per-entity rate limit on heartbeat-driven broadcasts.
#[derive(Debug)]
pub struct BroadcastThrottle {
    interval_ms: i64,
    last: HashMap<String, i64>,
}

impl BroadcastThrottle {
    #[must_use]
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last: HashMap::new(),
        }
    }

    /// Decide whether to broadcast now; a forced broadcast always passes.
    ///
    /// Records `now` as the last broadcast when it returns true.
    pub fn should_broadcast(&mut self, id: &str, now: i64, forced: bool) -> bool {
        let due = self
            .last
            .get(id)
            .is_none_or(|last| now - last > self.interval_ms);
        if forced || due {
            self.last.insert(id.to_string(), now);
            true
        } else {
            false
        }
    }

    pub fn record(&mut self, id: &str, now: i64) {
        self.last.insert(id.to_string(), now);
    }

    pub fn forget(&mut self, id: &str) {
        self.last.remove(id);
    }
}
