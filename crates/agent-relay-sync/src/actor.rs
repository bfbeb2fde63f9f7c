//! The single writer behind [`crate::SyncEngine`].
//!
//! All cache mutations happen on one task fed by a command channel, so
//! heartbeats, sweeps and refreshes never interleave.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use agent_relay_core::{
    EventBus, Machine, MachineMetadata, Session, SessionMetadata, StoreError, SyncEvent,
    VersionedStore,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, millis},
    config::SyncConfig,
    liveness::{
        BroadcastThrottle, HeartbeatVerdict, MachineAlive, SessionAlive, SessionEnd,
        check_heartbeat, is_expired,
    },
    todos::extract_todos,
};

/// Entities the inactivity sweep marked inactive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: Vec<String>,
    pub machines: Vec<String>,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.machines.is_empty()
    }
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    RefreshSession {
        id: String,
        reply: Reply<Result<Option<Session>, StoreError>>,
    },
    RefreshMachine {
        id: String,
        reply: Reply<Result<Option<Machine>, StoreError>>,
    },
    GetSession {
        id: String,
        reply: Reply<Option<Session>>,
    },
    ListSessions {
        namespace: Option<String>,
        reply: Reply<Vec<Session>>,
    },
    GetMachine {
        id: String,
        reply: Reply<Option<Machine>>,
    },
    ListMachines {
        namespace: Option<String>,
        reply: Reply<Vec<Machine>>,
    },
    SessionAlive {
        alive: SessionAlive,
        reply: Reply<()>,
    },
    SessionEnd {
        end: SessionEnd,
        reply: Reply<()>,
    },
    MachineAlive {
        alive: MachineAlive,
        reply: Reply<()>,
    },
    Sweep {
        reply: Reply<SweepReport>,
    },
    Shutdown,
}

pub(crate) struct Actor {
    store: Arc<dyn VersionedStore>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    sessions: HashMap<String, Session>,
    machines: HashMap<String, Machine>,
    throttle: BroadcastThrottle,
    todo_backfill_seen: HashSet<String>,
}

impl Actor {
    pub(crate) fn new(
        store: Arc<dyn VersionedStore>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let throttle = BroadcastThrottle::new(millis(config.broadcast_interval));
        Self {
            store,
            events,
            clock,
            config,
            sessions: HashMap::new(),
            machines: HashMap::new(),
            throttle,
            todo_backfill_seen: HashSet::new(),
        }
    }

    /// Rebuild the cache from the store.
    ///
    /// Entities persisted as active whose last activity already expired
    /// come back inactive.
    pub(crate) async fn load(&mut self) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let session_timeout = millis(self.config.session_timeout);
        let machine_timeout = millis(self.config.machine_timeout);

        for mut session in self.store.list_sessions(None).await? {
            session.thinking = false;
            if session.active && is_expired(session.active_at, now, session_timeout) {
                session.active = false;
                self.persist_session_activity(&session).await;
            }
            self.sessions.insert(session.id.clone(), session);
        }
        for mut machine in self.store.list_machines(None).await? {
            if machine.active && is_expired(machine.active_at, now, machine_timeout) {
                machine.active = false;
                self.persist_machine_activity(&machine).await;
            }
            self.machines.insert(machine.id.clone(), machine);
        }

        info!(
            sessions = self.sessions.len(),
            machines = self.machines.len(),
            "sync cache loaded"
        );
        Ok(())
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let period = self.config.sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                _ = sweep.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        debug!(?report, "inactivity sweep");
                    }
                }
            }
        }
        info!("sync engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::RefreshSession { id, reply } => {
                let _ = reply.send(self.refresh_session(&id).await);
            }
            Command::RefreshMachine { id, reply } => {
                let _ = reply.send(self.refresh_machine(&id).await);
            }
            Command::GetSession { id, reply } => {
                let _ = reply.send(self.get_session(&id).await);
            }
            Command::ListSessions { namespace, reply } => {
                let _ = reply.send(self.list_sessions(namespace.as_deref()));
            }
            Command::GetMachine { id, reply } => {
                let _ = reply.send(self.machines.get(&id).cloned());
            }
            Command::ListMachines { namespace, reply } => {
                let _ = reply.send(self.list_machines(namespace.as_deref()));
            }
            Command::SessionAlive { alive, reply } => {
                self.session_alive(alive).await;
                let _ = reply.send(());
            }
            Command::SessionEnd { end, reply } => {
                self.session_end(end).await;
                let _ = reply.send(());
            }
            Command::MachineAlive { alive, reply } => {
                self.machine_alive(alive).await;
                let _ = reply.send(());
            }
            Command::Sweep { reply } => {
                let _ = reply.send(self.sweep().await);
            }
            Command::Shutdown => {}
        }
    }

    fn accept_heartbeat(&self, kind: &'static str, id: &str, time: i64) -> bool {
        let now = self.clock.now_millis();
        match check_heartbeat(time, now, millis(self.config.heartbeat_max_age)) {
            HeartbeatVerdict::Accept => true,
            verdict => {
                debug!(kind, id, time, now, ?verdict, "discarding heartbeat");
                false
            }
        }
    }

    // --- sessions ---

    async fn refresh_session(&mut self, id: &str) -> Result<Option<Session>, StoreError> {
        let Some(mut fresh) = self.store.get_session(id).await? else {
            if let Some(gone) = self.sessions.remove(id) {
                self.throttle.forget(id);
                self.todo_backfill_seen.remove(id);
                self.events.publish(SyncEvent::SessionRemoved {
                    session_id: gone.id,
                    namespace: gone.namespace,
                });
            }
            return Ok(None);
        };

        let previous = self.sessions.get(id);
        let added = previous.is_none();
        match previous {
            Some(previous) => {
                fresh.active = previous.active;
                fresh.active_at = fresh.active_at.max(previous.active_at);
                fresh.thinking = previous.thinking;
            }
            None => {
                fresh.thinking = false;
                let now = self.clock.now_millis();
                if fresh.active
                    && is_expired(fresh.active_at, now, millis(self.config.session_timeout))
                {
                    fresh.active = false;
                }
            }
        }
        self.backfill_todos(&mut fresh).await;

        self.sessions.insert(fresh.id.clone(), fresh.clone());
        let event = if added {
            let meta = SessionMetadata::from_value(&fresh.metadata).unwrap_or_default();
            info!(
                session_id = %fresh.id,
                tag = %fresh.tag,
                path = meta.path.as_deref().unwrap_or("-"),
                "session tracked"
            );
            SyncEvent::SessionAdded {
                session: fresh.clone(),
            }
        } else {
            SyncEvent::SessionUpdated {
                session: fresh.clone(),
            }
        };
        self.events.publish(event);
        Ok(Some(fresh))
    }

    async fn get_session(&mut self, id: &str) -> Option<Session> {
        if !self.sessions.contains_key(id) {
            match self.refresh_session(id).await {
                Ok(found) => return found,
                Err(e) => {
                    warn!(session_id = id, error = %e, "failed to load session");
                    return None;
                }
            }
        }
        let mut session = self.sessions.get(id)?.clone();
        if self.backfill_todos(&mut session).await {
            self.sessions.insert(session.id.clone(), session.clone());
        }
        Some(session)
    }

    fn list_sessions(&self, namespace: Option<&str>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| namespace.is_none_or(|ns| s.namespace == ns))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Recover a missing todo snapshot from recent messages, once per session.
    ///
    /// Returns whether `session` was changed.
    async fn backfill_todos(&mut self, session: &mut Session) -> bool {
        if session.todos.is_some() || !self.todo_backfill_seen.insert(session.id.clone()) {
            return false;
        }

        let recent = match self
            .store
            .get_messages(&session.id, self.config.todo_backfill_scan, None)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "todo backfill scan failed");
                return false;
            }
        };
        let Some((todos, at)) = recent
            .iter()
            .rev()
            .find_map(|m| extract_todos(&m.content).map(|todos| (todos, m.created_at)))
        else {
            return false;
        };

        let value = match serde_json::to_value(&todos) {
            Ok(value) => value,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "todo backfill encode failed");
                return false;
            }
        };
        match self
            .store
            .set_session_todos(&session.id, value.clone(), at, &session.namespace)
            .await
        {
            Ok(true) => {
                info!(session_id = %session.id, count = todos.len(), "backfilled todos");
                session.todos = Some(value);
                session.todos_updated_at = Some(at);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "todo backfill write failed");
                false
            }
        }
    }

    async fn cached_session(&mut self, id: &str) -> bool {
        if self.sessions.contains_key(id) {
            return true;
        }
        match self.refresh_session(id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(session_id = id, error = %e, "failed to load session");
                false
            }
        }
    }

    async fn session_alive(&mut self, alive: SessionAlive) {
        if !self.accept_heartbeat("session", &alive.sid, alive.time) {
            return;
        }
        if !self.cached_session(&alive.sid).await {
            debug!(session_id = %alive.sid, "heartbeat for unknown session");
            return;
        }
        let now = self.clock.now_millis();
        let Some(session) = self.sessions.get_mut(&alive.sid) else {
            return;
        };

        let became_active = !session.active;
        let thinking_changed = session.thinking != alive.thinking;
        session.active = true;
        session.active_at = session.active_at.max(alive.time);
        session.thinking = alive.thinking;
        let snapshot = session.clone();

        if became_active {
            self.persist_session_activity(&snapshot).await;
        }
        if self
            .throttle
            .should_broadcast(&snapshot.id, now, became_active || thinking_changed)
        {
            self.events
                .publish(SyncEvent::SessionUpdated { session: snapshot });
        }
    }

    async fn session_end(&mut self, end: SessionEnd) {
        if !self.accept_heartbeat("session-end", &end.sid, end.time) {
            return;
        }
        if !self.cached_session(&end.sid).await {
            return;
        }
        let now = self.clock.now_millis();
        let Some(session) = self.sessions.get_mut(&end.sid) else {
            return;
        };

        let changed = session.active || session.thinking;
        session.active = false;
        session.thinking = false;
        session.active_at = session.active_at.max(end.time);
        let snapshot = session.clone();

        if changed {
            self.persist_session_activity(&snapshot).await;
            self.throttle.record(&snapshot.id, now);
            self.events
                .publish(SyncEvent::SessionUpdated { session: snapshot });
        }
    }

    async fn persist_session_activity(&self, session: &Session) {
        if let Err(e) = self
            .store
            .set_session_activity(&session.id, session.active, session.active_at)
            .await
        {
            warn!(session_id = %session.id, error = %e, "failed to persist session activity");
        }
    }

    // --- machines ---

    async fn refresh_machine(&mut self, id: &str) -> Result<Option<Machine>, StoreError> {
        let Some(mut fresh) = self.store.get_machine(id).await? else {
            if self.machines.remove(id).is_some() {
                self.throttle.forget(id);
            }
            return Ok(None);
        };

        let previous = self.machines.get(id);
        let added = previous.is_none();
        match previous {
            Some(previous) => {
                fresh.active = previous.active;
                fresh.active_at = fresh.active_at.max(previous.active_at);
            }
            None => {
                let now = self.clock.now_millis();
                if fresh.active
                    && is_expired(fresh.active_at, now, millis(self.config.machine_timeout))
                {
                    fresh.active = false;
                }
            }
        }

        self.machines.insert(fresh.id.clone(), fresh.clone());
        let event = if added {
            let meta = MachineMetadata::from_value(&fresh.metadata).unwrap_or_default();
            info!(
                machine_id = %fresh.id,
                host = meta.host.as_deref().unwrap_or("-"),
                platform = meta.platform.as_deref().unwrap_or("-"),
                "machine tracked"
            );
            SyncEvent::MachineAdded {
                machine: fresh.clone(),
            }
        } else {
            SyncEvent::MachineUpdated {
                machine: fresh.clone(),
            }
        };
        self.events.publish(event);
        Ok(Some(fresh))
    }

    fn list_machines(&self, namespace: Option<&str>) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self
            .machines
            .values()
            .filter(|m| namespace.is_none_or(|ns| m.namespace == ns))
            .cloned()
            .collect();
        machines.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        machines
    }

    async fn machine_alive(&mut self, alive: MachineAlive) {
        if !self.accept_heartbeat("machine", &alive.machine_id, alive.time) {
            return;
        }
        if !self.machines.contains_key(&alive.machine_id) {
            match self.refresh_machine(&alive.machine_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(machine_id = %alive.machine_id, "heartbeat for unknown machine");
                    return;
                }
                Err(e) => {
                    warn!(machine_id = %alive.machine_id, error = %e, "failed to load machine");
                    return;
                }
            }
        }
        let now = self.clock.now_millis();
        let Some(machine) = self.machines.get_mut(&alive.machine_id) else {
            return;
        };

        let became_active = !machine.active;
        machine.active = true;
        machine.active_at = machine.active_at.max(alive.time);
        let snapshot = machine.clone();

        if became_active {
            self.persist_machine_activity(&snapshot).await;
        }
        if self.throttle.should_broadcast(&snapshot.id, now, became_active) {
            self.events
                .publish(SyncEvent::MachineUpdated { machine: snapshot });
        }
    }

    async fn persist_machine_activity(&self, machine: &Machine) {
        if let Err(e) = self
            .store
            .set_machine_activity(&machine.id, machine.active, machine.active_at)
            .await
        {
            warn!(machine_id = %machine.id, error = %e, "failed to persist machine activity");
        }
    }

    // --- sweep ---

    async fn sweep(&mut self) -> SweepReport {
        let now = self.clock.now_millis();
        let session_timeout = millis(self.config.session_timeout);
        let machine_timeout = millis(self.config.machine_timeout);

        let mut expired_sessions = Vec::new();
        for session in self.sessions.values_mut() {
            if session.active && is_expired(session.active_at, now, session_timeout) {
                session.active = false;
                session.thinking = false;
                expired_sessions.push(session.clone());
            }
        }
        let mut expired_machines = Vec::new();
        for machine in self.machines.values_mut() {
            if machine.active && is_expired(machine.active_at, now, machine_timeout) {
                machine.active = false;
                expired_machines.push(machine.clone());
            }
        }

        let mut report = SweepReport::default();
        for session in expired_sessions {
            self.persist_session_activity(&session).await;
            self.throttle.record(&session.id, now);
            report.sessions.push(session.id.clone());
            self.events.publish(SyncEvent::SessionUpdated { session });
        }
        for machine in expired_machines {
            self.persist_machine_activity(&machine).await;
            self.throttle.record(&machine.id, now);
            report.machines.push(machine.id.clone());
            self.events.publish(SyncEvent::MachineUpdated { machine });
        }
        report.sessions.sort();
        report.machines.sort();
        report
    }
}
