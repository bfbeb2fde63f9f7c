//! Public handle over the sync actor: cache reads, liveness, CAS façade and RPC.

use std::sync::Arc;

use agent_relay_core::{
    CasOutcome, EventBus, Machine, Message, Session, StoreError, SyncEvent, UpdateEnvelope,
    VersionedStore,
};
use agent_relay_rpc::{RpcRouter, scoped_method};
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    actor::{Actor, Command, SweepReport},
    clock::{Clock, SystemClock},
    config::SyncConfig,
    error::SyncError,
    liveness::{MachineAlive, SessionAlive, SessionEnd},
    todos::extract_todos,
};

/// Coordinator-side view of all sessions and machines.
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn VersionedStore>,
    router: Arc<RpcRouter>,
    events: Arc<EventBus>,
    commands: mpsc::Sender<Command>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Load the cache from `store` and start the engine on the wall clock.
    ///
    /// # Errors
    /// Returns error if the initial load fails.
    pub async fn start(
        store: Arc<dyn VersionedStore>,
        router: Arc<RpcRouter>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        Self::start_with_clock(store, router, config, Arc::new(SystemClock)).await
    }

    /// Like [`SyncEngine::start`] with an explicit time source.
    ///
    /// # Errors
    /// Returns error if the initial load fails.
    pub async fn start_with_clock(
        store: Arc<dyn VersionedStore>,
        router: Arc<RpcRouter>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let events = Arc::new(EventBus::new());
        let mut actor = Actor::new(
            Arc::clone(&store),
            Arc::clone(&events),
            clock,
            config.clone(),
        );
        actor.load().await?;

        let (commands, rx) = mpsc::channel(config.command_buffer.max(1));
        tokio::spawn(actor.run(rx));

        Ok(Self {
            store,
            router,
            events,
            commands,
            config,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Stop the actor. Pending and later calls fail with `EngineStopped`.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn VersionedStore> {
        &self.store
    }

    #[must_use]
    pub fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // --- events ---

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Recent events followed by live ones.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, SyncEvent> {
        self.events.history_plus_stream()
    }

    // --- cache reads ---

    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, SyncError> {
        let id = id.to_string();
        self.request(|reply| Command::GetSession { id, reply }).await
    }

    /// Namespace of the session or machine called `id`, sessions first.
    ///
    /// # Errors
    /// Returns error if the store fails or the engine stopped.
    pub async fn entity_namespace(&self, id: &str) -> Result<Option<String>, SyncError> {
        if let Some(session) = self.get_session(id).await? {
            return Ok(Some(session.namespace));
        }
        if let Some(machine) = self.get_machine(id).await? {
            return Ok(Some(machine.namespace));
        }
        Ok(self.store.get_machine(id).await?.map(|m| m.namespace))
    }

    /// Sessions in `namespace` (all when `None`), most recently updated first.
    ///
    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn list_sessions(&self, namespace: Option<&str>) -> Result<Vec<Session>, SyncError> {
        let namespace = namespace.map(str::to_string);
        self.request(|reply| Command::ListSessions { namespace, reply })
            .await
    }

    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn get_machine(&self, id: &str) -> Result<Option<Machine>, SyncError> {
        let id = id.to_string();
        self.request(|reply| Command::GetMachine { id, reply }).await
    }

    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn list_machines(&self, namespace: Option<&str>) -> Result<Vec<Machine>, SyncError> {
        let namespace = namespace.map(str::to_string);
        self.request(|reply| Command::ListMachines { namespace, reply })
            .await
    }

    /// Reload a session from the store and notify subscribers.
    ///
    /// # Errors
    /// Returns error if the store read fails or the engine stopped.
    pub async fn refresh_session(&self, id: &str) -> Result<Option<Session>, SyncError> {
        let id = id.to_string();
        Ok(self
            .request(|reply| Command::RefreshSession { id, reply })
            .await??)
    }

    /// # Errors
    /// Returns error if the store read fails or the engine stopped.
    pub async fn refresh_machine(&self, id: &str) -> Result<Option<Machine>, SyncError> {
        let id = id.to_string();
        Ok(self
            .request(|reply| Command::RefreshMachine { id, reply })
            .await??)
    }

    async fn refresh_after_write(&self, session_id: &str) {
        if let Err(e) = self.refresh_session(session_id).await {
            warn!(session_id, error = %e, "refresh after write failed");
        }
    }

    async fn refresh_machine_after_write(&self, machine_id: &str) {
        if let Err(e) = self.refresh_machine(machine_id).await {
            warn!(machine_id, error = %e, "refresh after write failed");
        }
    }

    // --- liveness ---

    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn handle_session_alive(&self, alive: SessionAlive) -> Result<(), SyncError> {
        self.request(|reply| Command::SessionAlive { alive, reply })
            .await
    }

    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn handle_session_end(&self, end: SessionEnd) -> Result<(), SyncError> {
        self.request(|reply| Command::SessionEnd { end, reply }).await
    }

    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn handle_machine_alive(&self, alive: MachineAlive) -> Result<(), SyncError> {
        self.request(|reply| Command::MachineAlive { alive, reply })
            .await
    }

    /// Run the inactivity sweep immediately.
    ///
    /// # Errors
    /// Returns error if the engine stopped.
    pub async fn sweep_now(&self) -> Result<SweepReport, SyncError> {
        self.request(|reply| Command::Sweep { reply }).await
    }

    // --- sessions ---

    /// # Errors
    /// Returns error if the store fails or the engine stopped.
    pub async fn get_or_create_session(
        &self,
        tag: &str,
        metadata: Value,
        agent_state: Option<Value>,
        namespace: &str,
    ) -> Result<Session, SyncError> {
        let stored = self
            .store
            .get_or_create_session(tag, metadata, agent_state, namespace)
            .await?;
        Ok(self.refresh_session(&stored.id).await?.unwrap_or(stored))
    }

    pub async fn update_session_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> UpdateEnvelope<Value> {
        let result = self
            .store
            .update_session_metadata(id, metadata, expected_version, namespace)
            .await;
        if matches!(result, Ok(CasOutcome::Applied { .. })) {
            self.refresh_after_write(id).await;
        }
        result.into()
    }

    pub async fn update_session_agent_state(
        &self,
        id: &str,
        agent_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> UpdateEnvelope<Option<Value>> {
        let result = self
            .store
            .update_session_agent_state(id, agent_state, expected_version, namespace)
            .await;
        if matches!(result, Ok(CasOutcome::Applied { .. })) {
            self.refresh_after_write(id).await;
        }
        result.into()
    }

    /// Delete a session and its messages.
    ///
    /// # Errors
    /// Returns error if the store fails or the engine stopped.
    pub async fn delete_session(&self, id: &str, namespace: &str) -> Result<bool, SyncError> {
        let deleted = self.store.delete_session(id, namespace).await?;
        if deleted {
            self.refresh_session(id).await?;
        }
        Ok(deleted)
    }

    // --- machines ---

    /// # Errors
    /// Returns error if the store fails or the engine stopped.
    pub async fn get_or_create_machine(
        &self,
        id: &str,
        metadata: Value,
        daemon_state: Option<Value>,
        namespace: &str,
    ) -> Result<Machine, SyncError> {
        let stored = self
            .store
            .get_or_create_machine(id, metadata, daemon_state, namespace)
            .await?;
        Ok(self.refresh_machine(&stored.id).await?.unwrap_or(stored))
    }

    pub async fn update_machine_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> UpdateEnvelope<Value> {
        let result = self
            .store
            .update_machine_metadata(id, metadata, expected_version, namespace)
            .await;
        if matches!(result, Ok(CasOutcome::Applied { .. })) {
            self.refresh_machine_after_write(id).await;
        }
        result.into()
    }

    pub async fn update_machine_daemon_state(
        &self,
        id: &str,
        daemon_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> UpdateEnvelope<Option<Value>> {
        let result = self
            .store
            .update_machine_daemon_state(id, daemon_state, expected_version, namespace)
            .await;
        if matches!(result, Ok(CasOutcome::Applied { .. })) {
            self.refresh_machine_after_write(id).await;
        }
        result.into()
    }

    // --- messages ---

    /// Append a message, notify subscribers and pick up any todo list it carries.
    ///
    /// A resubmitted `local_id` returns the original row; subscribers may see
    /// it announced again and should key on the message id. Once the row is
    /// stored the call succeeds, even if the todo snapshot cannot be saved.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn add_message(
        &self,
        session_id: &str,
        content: Value,
        local_id: Option<&str>,
    ) -> Result<Message, SyncError> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let todos = extract_todos(&content);
        let message = self.store.add_message(session_id, content, local_id).await?;
        self.events.publish(SyncEvent::MessageAdded {
            message: message.clone(),
            namespace: session.namespace.clone(),
        });

        if let Some(todos) = todos {
            if let Err(e) = self.record_todos(&session, &todos, message.created_at).await {
                warn!(session_id, error = %e, "failed to save todos from message");
            }
        }
        Ok(message)
    }

    async fn record_todos(
        &self,
        session: &Session,
        todos: &[agent_relay_core::TodoItem],
        at: i64,
    ) -> Result<(), SyncError> {
        let value = serde_json::to_value(todos).map_err(StoreError::from)?;
        if self
            .store
            .set_session_todos(&session.id, value, at, &session.namespace)
            .await?
        {
            debug!(session_id = %session.id, count = todos.len(), "todos updated from message");
            self.refresh_after_write(&session.id).await;
        }
        Ok(())
    }

    /// # Errors
    /// Returns error if the store fails.
    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<Message>, SyncError> {
        Ok(self.store.get_messages(session_id, limit, before_seq).await?)
    }

    /// # Errors
    /// Returns error if the store fails.
    pub async fn get_messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, SyncError> {
        Ok(self
            .store
            .get_messages_after(session_id, after_seq, limit)
            .await?)
    }

    // --- rpc ---

    /// Call `method` on whichever connection registered it for `owner`.
    ///
    /// The reply is parsed as JSON; a reply that is not JSON comes back as a
    /// string value.
    ///
    /// # Errors
    /// Returns error if the method is not registered, the owner goes away,
    /// or no reply arrives within the configured window.
    pub async fn call_rpc(
        &self,
        owner: &str,
        method: &str,
        params: &Value,
    ) -> Result<Value, SyncError> {
        let scoped = scoped_method(owner, method);
        let params = serde_json::to_string(params)?;
        let raw = self
            .router
            .call(&scoped, params, self.config.rpc_timeout)
            .await?;
        Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }
}
