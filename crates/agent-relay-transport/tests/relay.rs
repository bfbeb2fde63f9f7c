//! End-to-end behaviour of the coordinator endpoint and runner client.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use agent_relay_rpc::{HandlerError, RpcHandlerManager, RpcRouter, scoped_method};
use agent_relay_store::MemoryStore;
use agent_relay_sync::{SyncConfig, SyncEngine};
use agent_relay_transport::{
    ClientConfig, ClientMessage, RelayClient, ServerMessage, relay_router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower::ServiceExt;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn engine() -> SyncEngine {
    SyncEngine::start(
        Arc::new(MemoryStore::new()),
        Arc::new(RpcRouter::new()),
        SyncConfig::default(),
    )
    .await
    .unwrap()
}

async fn serve(engine: SyncEngine) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, relay_router(engine)).await.unwrap();
    });
    addr
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

async fn send(socket: &mut Socket, frame: &ClientMessage) {
    let json = serde_json::to_string(frame).unwrap();
    socket.send(Message::text(json)).await.unwrap();
}

async fn next_frame(socket: &mut Socket) -> ServerMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn health_endpoint_answers() {
    let response = relay_router(engine().await)
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
}

#[tokio::test]
async fn client_methods_are_callable_through_the_engine() {
    let engine = engine().await;
    let session = engine
        .get_or_create_session("proj", json!({}), None, "default")
        .await
        .unwrap();
    let addr = serve(engine.clone()).await;

    let handlers = Arc::new(RpcHandlerManager::new(session.id.clone()));
    handlers.register_fn("echo", |params| async move { Ok(params) });
    handlers.register_fn("fail", |_| async move { Err(HandlerError::new("nope")) });

    let client = RelayClient::new(ClientConfig::new(format!("ws://{addr}/ws")), handlers);
    let client_task = tokio::spawn(async move { client.run().await });

    let router = Arc::clone(engine.router());
    let (echo, fail) = (
        scoped_method(&session.id, "echo"),
        scoped_method(&session.id, "fail"),
    );
    wait_for(|| router.owner_of(&echo).is_some() && router.owner_of(&fail).is_some()).await;

    let reply = engine
        .call_rpc(&session.id, "echo", &json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"x": 1}));

    let failed = engine.call_rpc(&session.id, "fail", &json!(null)).await.unwrap();
    assert_eq!(failed, json!({"error": "nope"}));

    client_task.abort();
}

#[tokio::test]
async fn versioned_updates_are_acknowledged_and_broadcast() {
    let engine = engine().await;
    let session = engine
        .get_or_create_session("proj", json!({"name": "a"}), None, "default")
        .await
        .unwrap();
    let addr = serve(engine.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?subscribe=true"))
        .await
        .unwrap();
    send(
        &mut socket,
        &ClientMessage::UpdateMetadata {
            ack_id: "a1".into(),
            sid: session.id.clone(),
            metadata: json!({"name": "b"}),
            expected_version: 1,
        },
    )
    .await;

    let mut acked = None;
    let mut saw_update = false;
    while acked.is_none() || !saw_update {
        match next_frame(&mut socket).await {
            ServerMessage::Ack { ack_id, result } => {
                assert_eq!(ack_id, "a1");
                acked = Some(result);
            }
            ServerMessage::Update { event } => {
                assert_eq!(event.entity_id(), session.id);
                saw_update = true;
            }
            _ => {}
        }
    }
    assert_eq!(
        acked.unwrap(),
        json!({"result": "success", "version": 2, "value": {"name": "b"}})
    );

    send(
        &mut socket,
        &ClientMessage::UpdateMetadata {
            ack_id: "a2".into(),
            sid: session.id.clone(),
            metadata: json!({"name": "stale"}),
            expected_version: 1,
        },
    )
    .await;
    loop {
        if let ServerMessage::Ack { ack_id, result } = next_frame(&mut socket).await {
            assert_eq!(ack_id, "a2");
            assert_eq!(result["result"], "version-mismatch");
            assert_eq!(result["value"], json!({"name": "b"}));
            break;
        }
    }
}

#[tokio::test]
async fn closing_the_socket_releases_its_methods() {
    let engine = engine().await;
    engine
        .get_or_create_machine("m1", json!({}), None, "default")
        .await
        .unwrap();
    let addr = serve(engine.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    send(
        &mut socket,
        &ClientMessage::RpcRegister {
            method: "m1:spawn".into(),
        },
    )
    .await;
    assert_eq!(
        next_frame(&mut socket).await,
        ServerMessage::RpcRegistered {
            method: "m1:spawn".into()
        }
    );

    send(&mut socket, &ClientMessage::Ping).await;
    assert_eq!(next_frame(&mut socket).await, ServerMessage::Pong);

    socket.close(None).await.unwrap();
    let router = Arc::clone(engine.router());
    wait_for(|| router.owner_of("m1:spawn").is_none()).await;
}

#[tokio::test]
async fn malformed_frames_get_an_error_reply() {
    let addr = serve(engine().await).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    socket.send(Message::text("{\"type\":\"bogus\"}")).await.unwrap();
    assert!(matches!(next_frame(&mut socket).await, ServerMessage::Error { .. }));
}

#[tokio::test]
async fn announced_machine_is_created_before_its_heartbeat() {
    let engine = engine().await;
    let addr = serve(engine.clone()).await;

    let announce = ClientMessage::CreateMachine {
        ack_id: None,
        machine_id: "m1".into(),
        metadata: json!({"host": "box"}),
        daemon_state: Some(json!({"status": "running"})),
    };
    let client = RelayClient::new(
        ClientConfig::new(format!("ws://{addr}/ws")),
        Arc::new(RpcHandlerManager::new("m1")),
    )
    .with_announcement(announce)
    .with_presence(agent_relay_transport::Presence::Machine {
        machine_id: "m1".into(),
    });
    let client_task = tokio::spawn(async move { client.run().await });

    let mut machine = None;
    for _ in 0..250 {
        machine = engine.get_machine("m1").await.unwrap().filter(|m| m.active);
        if machine.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let machine = machine.expect("machine never became active");
    assert_eq!(machine.metadata, json!({"host": "box"}));
    assert_eq!(machine.daemon_state, Some(json!({"status": "running"})));
    assert_eq!(machine.namespace, "default");

    client_task.abort();
}

#[tokio::test]
async fn create_session_frame_is_acked_with_the_session() {
    let engine = engine().await;
    let addr = serve(engine.clone()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?namespace=team"))
        .await
        .unwrap();

    send(
        &mut socket,
        &ClientMessage::CreateSession {
            ack_id: Some("c1".into()),
            tag: "proj".into(),
            metadata: json!({"path": "/src"}),
            agent_state: None,
        },
    )
    .await;

    let ServerMessage::Ack { ack_id, result } = next_frame(&mut socket).await else {
        panic!("expected an ack");
    };
    assert_eq!(ack_id, "c1");
    assert_eq!(result["tag"], "proj");
    assert_eq!(result["namespace"], "team");
    let sid = result["id"].as_str().unwrap().to_string();
    assert!(engine.get_session(&sid).await.unwrap().is_some());
}

#[tokio::test]
async fn other_namespaces_cannot_see_or_touch_a_session() {
    let engine = engine().await;
    let session = engine
        .get_or_create_session("proj", json!({}), None, "team-a")
        .await
        .unwrap();
    let addr = serve(engine.clone()).await;

    let (mut owner, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?namespace=team-a"))
            .await
            .unwrap();
    send(
        &mut owner,
        &ClientMessage::RpcRegister {
            method: scoped_method(&session.id, "status"),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut owner).await,
        ServerMessage::RpcRegistered { .. }
    ));

    let (mut outsider, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws?namespace=team-b&subscribe=true"
    ))
    .await
    .unwrap();

    send(
        &mut outsider,
        &ClientMessage::Message {
            ack_id: Some("m1".into()),
            sid: session.id.clone(),
            content: json!({"text": "injected"}),
            local_id: None,
        },
    )
    .await;
    let ServerMessage::Ack { ack_id, result } = next_frame(&mut outsider).await else {
        panic!("expected an ack");
    };
    assert_eq!(ack_id, "m1");
    assert!(result["error"].as_str().unwrap().contains("Not found"));

    send(
        &mut outsider,
        &ClientMessage::RpcCall {
            ack_id: "c1".into(),
            method: scoped_method(&session.id, "status"),
            params: json!(null),
        },
    )
    .await;
    let ServerMessage::Ack { ack_id, result } = next_frame(&mut outsider).await else {
        panic!("expected an ack");
    };
    assert_eq!(ack_id, "c1");
    assert!(result["error"].as_str().unwrap().contains("Not found"));

    send(
        &mut outsider,
        &ClientMessage::RpcRegister {
            method: scoped_method(&session.id, "status"),
        },
    )
    .await;
    assert!(matches!(next_frame(&mut outsider).await, ServerMessage::Error { .. }));

    send(
        &mut outsider,
        &ClientMessage::SessionAlive(agent_relay_sync::SessionAlive {
            sid: session.id.clone(),
            time: agent_relay_core::types::now_millis(),
            thinking: true,
        }),
    )
    .await;
    assert!(matches!(next_frame(&mut outsider).await, ServerMessage::Error { .. }));

    engine
        .add_message(&session.id, json!({"text": "team-a secret"}), None)
        .await
        .unwrap();
    send(&mut outsider, &ClientMessage::Ping).await;
    assert_eq!(next_frame(&mut outsider).await, ServerMessage::Pong);

    let log = engine.get_messages(&session.id, 10, None).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].content, json!({"text": "team-a secret"}));
    let cached = engine.get_session(&session.id).await.unwrap().unwrap();
    assert!(!cached.active);
    assert!(
        engine
            .router()
            .owner_of(&scoped_method(&session.id, "status"))
            .is_some()
    );
}
