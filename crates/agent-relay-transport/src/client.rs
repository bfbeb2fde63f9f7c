//! Runner-side connection to the coordinator.
//!
//! The coordinator forgets a connection's methods when it drops, so every
//! (re)connect announces the full handler set again before anything else.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_relay_core::types::now_millis;
use agent_relay_rpc::RpcHandlerManager;
use agent_relay_sync::{MachineAlive, SessionAlive};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    protocol::{ClientMessage, ServerMessage},
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator endpoint, e.g. `ws://127.0.0.1:3005/ws`.
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// What this client reports liveness for.
#[derive(Debug, Clone)]
pub enum Presence {
    Session {
        sid: String,
        thinking: Arc<AtomicBool>,
    },
    Machine {
        machine_id: String,
    },
}

impl Presence {
    fn heartbeat(&self) -> ClientMessage {
        match self {
            Self::Session { sid, thinking } => ClientMessage::SessionAlive(SessionAlive {
                sid: sid.clone(),
                time: now_millis(),
                thinking: thinking.load(Ordering::Relaxed),
            }),
            Self::Machine { machine_id } => ClientMessage::MachineAlive(MachineAlive {
                machine_id: machine_id.clone(),
                time: now_millis(),
            }),
        }
    }
}

/// Delay before the next reconnect attempt.
#[must_use]
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// A reconnecting coordinator connection serving local RPC handlers.
pub struct RelayClient {
    config: ClientConfig,
    handlers: Arc<RpcHandlerManager>,
    presence: Option<Presence>,
    announcements: Vec<ClientMessage>,
}

impl RelayClient {
    #[must_use]
    pub const fn new(config: ClientConfig, handlers: Arc<RpcHandlerManager>) -> Self {
        Self {
            config,
            handlers,
            presence: None,
            announcements: Vec::new(),
        }
    }

    /// Send `frame` first thing on every connection, e.g. a `create-machine`.
    #[must_use]
    pub fn with_announcement(mut self, frame: ClientMessage) -> Self {
        self.announcements.push(frame);
        self
    }

    /// Send heartbeats for `presence` while connected.
    #[must_use]
    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = Some(presence);
        self
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<RpcHandlerManager> {
        &self.handlers
    }

    /// Stay connected until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            () = self.run() => {}
            () = shutdown => info!("relay client shutting down"),
        }
    }

    /// Connect and keep reconnecting with exponential backoff.
    pub async fn run(&self) {
        let mut backoff = self.config.reconnect_initial;
        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!(url = %self.config.url, "relay connection closed");
                    backoff = self.config.reconnect_initial;
                }
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, ?backoff, "relay connection failed");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, self.config.reconnect_max);
        }
    }

    /// One connection lifetime; errors mean it never got going or broke on write.
    async fn connect_once(&self) -> Result<(), TransportError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        info!(url = %self.config.url, "relay connected");
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();

        for frame in &self.announcements {
            let _ = out_tx.send(frame.clone());
        }
        for method in self.handlers.scoped_methods() {
            let _ = out_tx.send(ClientMessage::RpcRegister { method });
        }
        if let Some(presence) = &self.presence {
            let _ = out_tx.send(presence.heartbeat());
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                Some(frame) = out_rx.recv() => {
                    let json = serde_json::to_string(&frame)?;
                    sink.send(WsMessage::text(json)).await?;
                }
                _ = heartbeat.tick(), if self.presence.is_some() => {
                    if let Some(presence) = &self.presence {
                        let _ = out_tx.send(presence.heartbeat());
                    }
                }
                incoming = stream.next() => match incoming {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(()),
                    Some(Err(e)) => {
                        debug!(error = %e, "relay read failed");
                        return Ok(());
                    }
                    Some(Ok(WsMessage::Text(text))) => self.on_frame(text.as_str(), &out_tx),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn on_frame(&self, text: &str, out_tx: &mpsc::UnboundedSender<ClientMessage>) {
        let frame: ServerMessage = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Invalid server message: {e}");
                return;
            }
        };

        match frame {
            ServerMessage::RpcRequest {
                request_id,
                method,
                params,
            } => {
                let handlers = Arc::clone(&self.handlers);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let result = handlers.handle(&method, &params).await;
                    let _ = out_tx.send(ClientMessage::RpcResponse { request_id, result });
                });
            }
            ServerMessage::Error { message } => warn!("relay error: {message}"),
            ServerMessage::RpcRegistered { method } => debug!(method, "rpc method registered"),
            ServerMessage::Ack { .. } | ServerMessage::Update { .. } | ServerMessage::Pong => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_millis(500);
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay.as_millis());
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen, vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_session_heartbeat_reads_thinking_flag() {
        let thinking = Arc::new(AtomicBool::new(false));
        let presence = Presence::Session {
            sid: "s1".into(),
            thinking: Arc::clone(&thinking),
        };
        thinking.store(true, Ordering::Relaxed);
        match presence.heartbeat() {
            ClientMessage::SessionAlive(alive) => {
                assert_eq!(alive.sid, "s1");
                assert!(alive.thinking);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
