//! Coordinator server: SQLite store, sync engine and the relay WebSocket.
//!
//! Run with: cargo run -p relay-server
//!
//! `AGENT_RELAY_DB` picks the database file (default `agent-relay.db`),
//! `AGENT_RELAY_ADDR` the listen address (default `127.0.0.1:3005`).

use std::{net::SocketAddr, sync::Arc};

use agent_relay_rpc::RpcRouter;
use agent_relay_store::{SqliteStore, SqliteStoreConfig};
use agent_relay_sync::{SyncConfig, SyncEngine};
use agent_relay_transport::relay_router;
use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let db_path = std::env::var("AGENT_RELAY_DB").unwrap_or_else(|_| "agent-relay.db".into());
    let addr: SocketAddr = std::env::var("AGENT_RELAY_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3005".into())
        .parse()
        .context("AGENT_RELAY_ADDR is not a socket address")?;

    let store = Arc::new(
        SqliteStore::connect(&SqliteStoreConfig::file(&db_path))
            .await
            .with_context(|| format!("opening store at {db_path}"))?,
    );
    let engine = SyncEngine::start(
        store.clone(),
        Arc::new(RpcRouter::new()),
        SyncConfig::default(),
    )
    .await
    .context("starting sync engine")?;

    let app = relay_router(engine.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Relay listening on ws://{addr}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    engine.shutdown().await;
    store.close().await;
    Ok(())
}
