//! Engine tuning.

use std::time::Duration;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A session with no heartbeat for longer than this is marked inactive.
    pub session_timeout: Duration,
    /// A machine with no heartbeat for longer than this is marked inactive.
    pub machine_timeout: Duration,
    /// How often the inactivity sweep runs.
    pub sweep_interval: Duration,
    /// Heartbeats older than this are discarded.
    pub heartbeat_max_age: Duration,
    /// Minimum gap between unforced heartbeat broadcasts for one entity.
    pub broadcast_interval: Duration,
    /// Window for a forwarded RPC call to be answered.
    pub rpc_timeout: Duration,
    /// How many recent messages the todo backfill inspects.
    pub todo_backfill_scan: i64,
    /// Capacity of the engine command queue.
    pub command_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            machine_timeout: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(5),
            heartbeat_max_age: Duration::from_secs(10 * 60),
            broadcast_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            todo_backfill_scan: 100,
            command_buffer: 1024,
        }
    }
}
