//! Per-host daemon: takes the daemon lock, records its state and serves
//! machine-scoped RPC methods to the coordinator.
//!
//! Run with: cargo run -p relay-runner
//!
//! `AGENT_RELAY_URL` overrides the coordinator endpoint from settings;
//! `AGENT_RELAY_HOME` sets the state directory.

use std::sync::Arc;

use agent_relay_core::{MachineMetadata, types::now_millis};
use agent_relay_process::{DaemonState, ProcessCoordinator};
use agent_relay_rpc::RpcHandlerManager;
use agent_relay_transport::{ClientConfig, ClientMessage, Presence, RelayClient};
use anyhow::Context;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_URL: &str = "ws://127.0.0.1:3005/ws";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let coordinator = ProcessCoordinator::from_env()?;
    if let Some(running) = coordinator.running_daemon(VERSION)? {
        tracing::info!(pid = running.pid, "daemon already running");
        return Ok(());
    }

    let Some(lock) = coordinator.acquire_daemon_lock().await? else {
        tracing::warn!("another daemon holds the lock; exiting");
        return Ok(());
    };

    let settings = coordinator
        .update_settings(|mut settings| {
            settings
                .machine_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
            settings
        })
        .await?
        .context("settings lock not acquired")?;
    let machine_id = settings
        .machine_id
        .context("settings carry no machine id")?;

    coordinator.write_daemon_state(&DaemonState {
        pid: std::process::id(),
        http_port: 0,
        start_time: now_millis(),
        started_with_version: VERSION.to_string(),
        log_path: Some(coordinator.paths().logs_dir()),
    })?;

    let handlers = Arc::new(RpcHandlerManager::new(machine_id.clone()));
    handlers.register_fn("ping", |_| async move { Ok(json!({ "pong": now_millis() })) });
    handlers.register_fn("version", |_| async move { Ok(json!(VERSION)) });

    let url = std::env::var("AGENT_RELAY_URL")
        .ok()
        .or(settings.server_url)
        .unwrap_or_else(|| DEFAULT_URL.into());
    tracing::info!(%machine_id, %url, "daemon starting");

    let metadata = MachineMetadata {
        host: std::env::var("HOSTNAME").ok(),
        platform: Some(std::env::consts::OS.to_string()),
        home_dir: std::env::var("HOME").ok(),
        ..MachineMetadata::default()
    };
    let announce = ClientMessage::CreateMachine {
        ack_id: None,
        machine_id: machine_id.clone(),
        metadata: serde_json::to_value(&metadata)?,
        daemon_state: Some(json!({ "status": "running", "pid": std::process::id() })),
    };

    RelayClient::new(ClientConfig::new(url), handlers)
        .with_announcement(announce)
        .with_presence(Presence::Machine { machine_id })
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    coordinator.clear_daemon_state()?;
    lock.release()?;
    Ok(())
}
