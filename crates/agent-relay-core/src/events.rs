//! Sync events and the broadcast + history bus that fans them out.

use std::{collections::VecDeque, sync::RwLock};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{Machine, Message, Session};

/// Default number of recent events kept for late subscribers.
const HISTORY_EVENTS: usize = 256;

/// Change notification emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SyncEvent {
    SessionAdded { session: Session },
    SessionUpdated { session: Session },
    SessionRemoved { session_id: String, namespace: String },
    MachineAdded { machine: Machine },
    MachineUpdated { machine: Machine },
    /// `namespace` is the owning session's.
    MessageAdded { message: Message, namespace: String },
}

impl SyncEvent {
    /// Id of the session or machine the event concerns.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::SessionAdded { session } | Self::SessionUpdated { session } => &session.id,
            Self::SessionRemoved { session_id, .. } => session_id,
            Self::MachineAdded { machine } | Self::MachineUpdated { machine } => &machine.id,
            Self::MessageAdded { message, .. } => &message.session_id,
        }
    }

    /// Namespace of the entity the event concerns.
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::SessionAdded { session } | Self::SessionUpdated { session } => {
                &session.namespace
            }
            Self::MachineAdded { machine } | Self::MachineUpdated { machine } => {
                &machine.namespace
            }
            Self::SessionRemoved { namespace, .. } | Self::MessageAdded { namespace, .. } => {
                namespace
            }
        }
    }
}

/// Event bus with broadcast and bounded history.
///
/// A listener that connects late receives the retained history and then
/// switches to live events without a gap.
pub struct EventBus {
    history: RwLock<VecDeque<SyncEvent>>,
    capacity: usize,
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HISTORY_EVENTS)
    }

    /// Create a bus that retains at most `capacity` recent events.
    #[must_use]
    pub fn with_history(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Publish to live listeners and history.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event.clone()); // no listeners is fine

        let Ok(mut history) = self.history.write() else {
            tracing::error!("event history lock poisoned");
            return;
        };
        if self.capacity == 0 {
            return;
        }
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<SyncEvent> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stream that yields history first, then live events.
    ///
    /// Lagged receivers skip the dropped events rather than ending the stream.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SyncEvent> {
        let rx = self.subscribe();
        let history = self.history();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "event listener lagged");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}
