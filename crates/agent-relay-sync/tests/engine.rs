//! Sync engine behaviour over the in-memory store with a manual clock.

use std::{sync::Arc, time::Duration};

use agent_relay_core::{
    CasOutcome, Machine, Message, PushKeys, PushSubscription, Session, StoreError, SyncEvent,
    UpdateEnvelope, User, VersionedStore,
};
use agent_relay_rpc::{RpcError, RpcRouter};
use agent_relay_store::MemoryStore;
use agent_relay_sync::{
    MachineAlive, ManualClock, SessionAlive, SessionEnd, SyncConfig, SyncEngine, SyncError,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

// Far enough ahead that rows stamped with the wall clock are always older.
const T0: i64 = 4_102_444_800_000;

struct Harness {
    engine: SyncEngine,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    events: broadcast::Receiver<SyncEvent>,
}

fn quiet_config() -> SyncConfig {
    SyncConfig {
        // keep the background sweep out of the way; tests sweep explicitly
        sweep_interval: Duration::from_secs(3600),
        ..SyncConfig::default()
    }
}

async fn harness_with(store: Arc<MemoryStore>) -> Harness {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = SyncEngine::start_with_clock(
        store.clone(),
        Arc::new(RpcRouter::new()),
        quiet_config(),
        clock.clone(),
    )
    .await
    .unwrap();
    let events = engine.subscribe();
    Harness {
        engine,
        store,
        clock,
        events,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new())).await
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn alive(sid: &str, time: i64, thinking: bool) -> SessionAlive {
    SessionAlive {
        sid: sid.to_string(),
        time,
        thinking,
    }
}

#[tokio::test]
async fn created_session_is_announced() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({"path": "/p"}), None, "default")
        .await
        .unwrap();
    assert!(!session.active);

    let events = drain(&mut h.events);
    assert!(matches!(&events[..], [SyncEvent::SessionAdded { session: s }] if s.id == session.id));
}

#[tokio::test]
async fn heartbeat_activates_and_sweep_expires_once() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    drain(&mut h.events);

    h.engine
        .handle_session_alive(alive(&session.id, T0, false))
        .await
        .unwrap();
    let live = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert!(live.active);
    assert_eq!(live.active_at, T0);
    assert_eq!(drain(&mut h.events).len(), 1);

    // exactly at the timeout nothing happens
    h.clock.advance(Duration::from_secs(30));
    assert!(h.engine.sweep_now().await.unwrap().is_empty());

    h.clock.advance(Duration::from_millis(1));
    let report = h.engine.sweep_now().await.unwrap();
    assert_eq!(report.sessions, vec![session.id.clone()]);
    assert!(h.engine.sweep_now().await.unwrap().is_empty());

    let events = drain(&mut h.events);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SyncEvent::SessionUpdated { session } => {
            assert!(!session.active);
            assert!(!session.thinking);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let persisted = h.store.get_session(&session.id).await.unwrap().unwrap();
    assert!(!persisted.active);
}

#[tokio::test]
async fn future_and_stale_heartbeats_are_ignored() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    drain(&mut h.events);

    h.engine
        .handle_session_alive(alive(&session.id, T0 + 1, false))
        .await
        .unwrap();
    h.engine
        .handle_session_alive(alive(&session.id, T0 - 10 * 60 * 1000 - 1, false))
        .await
        .unwrap();

    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert!(!cached.active);
    assert_eq!(cached.active_at, session.active_at);
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn older_heartbeat_never_regresses_active_at() {
    let h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();

    h.engine
        .handle_session_alive(alive(&session.id, T0, false))
        .await
        .unwrap();
    h.engine
        .handle_session_alive(alive(&session.id, T0 - 5_000, false))
        .await
        .unwrap();

    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(cached.active_at, T0);
}

#[tokio::test]
async fn heartbeat_broadcasts_are_throttled() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    drain(&mut h.events);

    // activation always broadcasts
    h.engine
        .handle_session_alive(alive(&session.id, T0, false))
        .await
        .unwrap();
    assert_eq!(drain(&mut h.events).len(), 1);

    // steady heartbeats inside the interval stay quiet
    h.clock.advance(Duration::from_secs(2));
    h.engine
        .handle_session_alive(alive(&session.id, T0 + 2_000, false))
        .await
        .unwrap();
    assert!(drain(&mut h.events).is_empty());

    // a thinking flip is broadcast immediately
    h.engine
        .handle_session_alive(alive(&session.id, T0 + 2_000, true))
        .await
        .unwrap();
    let events = drain(&mut h.events);
    assert!(matches!(&events[..], [SyncEvent::SessionUpdated { session }] if session.thinking));

    // and an unchanged heartbeat after the interval broadcasts again
    h.clock.advance(Duration::from_secs(11));
    h.engine
        .handle_session_alive(alive(&session.id, T0 + 13_000, true))
        .await
        .unwrap();
    assert_eq!(drain(&mut h.events).len(), 1);
}

#[tokio::test]
async fn session_end_marks_inactive() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    h.engine
        .handle_session_alive(alive(&session.id, T0, true))
        .await
        .unwrap();
    drain(&mut h.events);

    h.engine
        .handle_session_end(SessionEnd {
            sid: session.id.clone(),
            time: T0,
        })
        .await
        .unwrap();

    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert!(!cached.active);
    assert!(!cached.thinking);
    assert_eq!(drain(&mut h.events).len(), 1);
}

#[tokio::test]
async fn machine_liveness_uses_its_own_timeout() {
    let mut h = harness().await;
    h.engine
        .get_or_create_machine("m1", json!({"host": "box"}), None, "default")
        .await
        .unwrap();
    h.engine
        .handle_machine_alive(MachineAlive {
            machine_id: "m1".into(),
            time: T0,
        })
        .await
        .unwrap();
    assert!(h.engine.get_machine("m1").await.unwrap().unwrap().active);
    drain(&mut h.events);

    h.clock.advance(Duration::from_secs(40));
    assert!(h.engine.sweep_now().await.unwrap().is_empty());

    h.clock.advance(Duration::from_secs(6));
    let report = h.engine.sweep_now().await.unwrap();
    assert_eq!(report.machines, vec!["m1".to_string()]);
    assert!(matches!(
        &drain(&mut h.events)[..],
        [SyncEvent::MachineUpdated { machine }] if !machine.active
    ));
}

#[tokio::test]
async fn cas_updates_keep_runtime_fields() {
    let h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({"name": "a"}), None, "default")
        .await
        .unwrap();
    h.engine
        .handle_session_alive(alive(&session.id, T0, true))
        .await
        .unwrap();

    let applied = h
        .engine
        .update_session_metadata(&session.id, json!({"name": "b"}), 1, "default")
        .await;
    assert_eq!(
        applied,
        UpdateEnvelope::Success {
            version: 2,
            value: json!({"name": "b"})
        }
    );

    let stale = h
        .engine
        .update_session_metadata(&session.id, json!({"name": "c"}), 1, "default")
        .await;
    assert_eq!(
        stale,
        UpdateEnvelope::VersionMismatch {
            version: 2,
            value: json!({"name": "b"})
        }
    );

    let missing = h
        .engine
        .update_session_agent_state("nope", None, 1, "default")
        .await;
    assert_eq!(missing, UpdateEnvelope::Error);

    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(cached.metadata, json!({"name": "b"}));
    assert!(cached.active);
    assert!(cached.thinking);
}

#[tokio::test]
async fn delete_session_is_announced() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    drain(&mut h.events);

    assert!(h.engine.delete_session(&session.id, "default").await.unwrap());
    assert!(h.engine.get_session(&session.id).await.unwrap().is_none());
    assert!(matches!(
        &drain(&mut h.events)[..],
        [SyncEvent::SessionRemoved { session_id, namespace }]
            if *session_id == session.id && namespace == "default"
    ));
}

fn todo_message(item: &str) -> serde_json::Value {
    json!({
        "role": "agent",
        "content": [{
            "type": "tool_use",
            "name": "TodoWrite",
            "input": {"todos": [{"content": item, "status": "pending"}]}
        }]
    })
}

#[tokio::test]
async fn messages_carry_todos_into_the_session() {
    let mut h = harness().await;
    let session = h
        .engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    drain(&mut h.events);

    let message = h
        .engine
        .add_message(&session.id, todo_message("ship it"), Some("local-1"))
        .await
        .unwrap();
    assert_eq!(message.seq, 1);

    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(cached.todos.unwrap()[0]["content"], "ship it");

    let events = drain(&mut h.events);
    assert!(matches!(
        events.first(),
        Some(SyncEvent::MessageAdded { namespace, .. }) if namespace == "default"
    ));
}

#[tokio::test]
async fn message_to_unknown_session_is_rejected_without_event() {
    let mut h = harness().await;
    let err = tokio_test::assert_err!(h.engine.add_message("missing", json!({}), None).await);
    assert!(matches!(err, SyncError::Store(StoreError::NotFound(_))));
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn stored_message_survives_a_failed_todo_write() {
    let store = Arc::new(TodosUnavailable(MemoryStore::new()));
    let engine = SyncEngine::start_with_clock(
        store.clone(),
        Arc::new(RpcRouter::new()),
        quiet_config(),
        Arc::new(ManualClock::new(T0)),
    )
    .await
    .unwrap();
    let session = engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();

    let message = tokio_test::assert_ok!(
        engine
            .add_message(&session.id, todo_message("lost"), None)
            .await
    );
    assert_eq!(message.seq, 1);

    let log = store.0.get_messages(&session.id, 10, None).await.unwrap();
    assert_eq!(log.len(), 1);
    let cached = engine.get_session(&session.id).await.unwrap().unwrap();
    assert!(cached.todos.is_none());
}

#[tokio::test]
async fn todos_are_backfilled_from_history_on_startup() {
    let store = Arc::new(MemoryStore::new());
    let session = store
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    store
        .add_message(&session.id, todo_message("first"), None)
        .await
        .unwrap();
    store
        .add_message(&session.id, todo_message("latest"), None)
        .await
        .unwrap();
    store
        .add_message(&session.id, json!({"text": "chatter"}), None)
        .await
        .unwrap();

    let h = harness_with(store).await;
    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(cached.todos.unwrap()[0]["content"], "latest");

    let persisted = h.store.get_session(&session.id).await.unwrap().unwrap();
    assert!(persisted.todos.is_some());
}

#[tokio::test]
async fn expired_active_sessions_load_inactive() {
    let store = Arc::new(MemoryStore::new());
    let session = store
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    store
        .set_session_activity(&session.id, true, T0 - 60_000)
        .await
        .unwrap();

    let h = harness_with(store).await;
    let cached = h.engine.get_session(&session.id).await.unwrap().unwrap();
    assert!(!cached.active);
}

#[tokio::test]
async fn call_rpc_forwards_to_registered_owner() {
    let router = Arc::new(RpcRouter::new());
    let engine = SyncEngine::start(Arc::new(MemoryStore::new()), router.clone(), quiet_config())
        .await
        .unwrap();

    let err = engine
        .call_rpc("sess1", "git-status", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Rpc(RpcError::MethodNotFound(m)) if m == "sess1:git-status"));

    let conn = uuid::Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    router.connect(conn, tx);
    tokio_test::assert_ok!(router.register(conn, "sess1:git-status"));

    let responder = {
        let router = router.clone();
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            router.complete(conn, &request.request_id, r#"{"clean":true}"#.into());
            let request = rx.recv().await.unwrap();
            router.complete(conn, &request.request_id, "not json".into());
        })
    };

    let reply = engine
        .call_rpc("sess1", "git-status", &json!({"cwd": "/"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"clean": true}));

    let raw = engine
        .call_rpc("sess1", "git-status", &json!(null))
        .await
        .unwrap();
    assert_eq!(raw, json!("not json"));
    responder.await.unwrap();
}

#[tokio::test]
async fn calls_fail_after_shutdown() {
    let h = harness().await;
    h.engine.shutdown().await;
    tokio::task::yield_now().await;

    let err = tokio_test::assert_err!(h.engine.list_sessions(None).await);
    assert!(matches!(err, SyncError::EngineStopped));
}

/// Memory store whose todo snapshot writes always fail.
struct TodosUnavailable(MemoryStore);

#[async_trait]
impl VersionedStore for TodosUnavailable {
    async fn get_or_create_session(
        &self,
        tag: &str,
        metadata: Value,
        agent_state: Option<Value>,
        namespace: &str,
    ) -> Result<Session, StoreError> {
        self.0
            .get_or_create_session(tag, metadata, agent_state, namespace)
            .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.0.get_session(id).await
    }

    async fn list_sessions(&self, namespace: Option<&str>) -> Result<Vec<Session>, StoreError> {
        self.0.list_sessions(namespace).await
    }

    async fn update_session_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError> {
        self.0
            .update_session_metadata(id, metadata, expected_version, namespace)
            .await
    }

    async fn update_session_agent_state(
        &self,
        id: &str,
        agent_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        self.0
            .update_session_agent_state(id, agent_state, expected_version, namespace)
            .await
    }

    async fn set_session_todos(
        &self,
        _id: &str,
        _todos: Value,
        _updated_at: i64,
        _namespace: &str,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Database("disk full".into()))
    }

    async fn set_session_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError> {
        self.0.set_session_activity(id, active, active_at).await
    }

    async fn delete_session(&self, id: &str, namespace: &str) -> Result<bool, StoreError> {
        self.0.delete_session(id, namespace).await
    }

    async fn get_or_create_machine(
        &self,
        id: &str,
        metadata: Value,
        daemon_state: Option<Value>,
        namespace: &str,
    ) -> Result<Machine, StoreError> {
        self.0
            .get_or_create_machine(id, metadata, daemon_state, namespace)
            .await
    }

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>, StoreError> {
        self.0.get_machine(id).await
    }

    async fn list_machines(&self, namespace: Option<&str>) -> Result<Vec<Machine>, StoreError> {
        self.0.list_machines(namespace).await
    }

    async fn update_machine_metadata(
        &self,
        id: &str,
        metadata: Value,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Value>, StoreError> {
        self.0
            .update_machine_metadata(id, metadata, expected_version, namespace)
            .await
    }

    async fn update_machine_daemon_state(
        &self,
        id: &str,
        daemon_state: Option<Value>,
        expected_version: i64,
        namespace: &str,
    ) -> Result<CasOutcome<Option<Value>>, StoreError> {
        self.0
            .update_machine_daemon_state(id, daemon_state, expected_version, namespace)
            .await
    }

    async fn set_machine_activity(
        &self,
        id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), StoreError> {
        self.0.set_machine_activity(id, active, active_at).await
    }

    async fn add_message(
        &self,
        session_id: &str,
        content: Value,
        local_id: Option<&str>,
    ) -> Result<Message, StoreError> {
        self.0.add_message(session_id, content, local_id).await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        self.0.get_messages(session_id, limit, before_seq).await
    }

    async fn get_messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.0.get_messages_after(session_id, after_seq, limit).await
    }

    async fn get_or_create_user(
        &self,
        platform: &str,
        platform_user_id: &str,
        namespace: &str,
    ) -> Result<User, StoreError> {
        self.0
            .get_or_create_user(platform, platform_user_id, namespace)
            .await
    }

    async fn get_user(
        &self,
        platform: &str,
        platform_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        self.0.get_user(platform, platform_user_id).await
    }

    async fn add_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
        keys: PushKeys,
    ) -> Result<PushSubscription, StoreError> {
        self.0.add_push_subscription(namespace, endpoint, keys).await
    }

    async fn remove_push_subscription(
        &self,
        namespace: &str,
        endpoint: &str,
    ) -> Result<bool, StoreError> {
        self.0.remove_push_subscription(namespace, endpoint).await
    }

    async fn list_push_subscriptions(
        &self,
        namespace: &str,
    ) -> Result<Vec<PushSubscription>, StoreError> {
        self.0.list_push_subscriptions(namespace).await
    }
}
