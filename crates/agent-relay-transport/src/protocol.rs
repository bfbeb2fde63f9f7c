//! Wire protocol between runners, viewers and the coordinator.
//!
//! Every frame is a JSON object tagged by `type`.

use agent_relay_core::SyncEvent;
use agent_relay_sync::{MachineAlive, SessionAlive, SessionEnd};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame sent to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Get-or-create a session by tag; acked with the session.
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<String>,
        tag: String,
        metadata: Value,
        #[serde(default)]
        agent_state: Option<Value>,
    },
    /// Get-or-create a machine by id; acked with the machine.
    CreateMachine {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<String>,
        machine_id: String,
        metadata: Value,
        #[serde(default)]
        daemon_state: Option<Value>,
    },
    SessionAlive(SessionAlive),
    SessionEnd(SessionEnd),
    MachineAlive(MachineAlive),
    /// CAS write of session metadata; answered with an [`ServerMessage::Ack`]
    /// carrying an update envelope.
    UpdateMetadata {
        ack_id: String,
        sid: String,
        metadata: Value,
        expected_version: i64,
    },
    UpdateState {
        ack_id: String,
        sid: String,
        agent_state: Option<Value>,
        expected_version: i64,
    },
    MachineUpdateMetadata {
        ack_id: String,
        machine_id: String,
        metadata: Value,
        expected_version: i64,
    },
    MachineUpdateState {
        ack_id: String,
        machine_id: String,
        daemon_state: Option<Value>,
        expected_version: i64,
    },
    /// Append a message to a session log.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<String>,
        sid: String,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<String>,
    },
    /// Announce a fully scoped method served by this connection.
    RpcRegister { method: String },
    RpcUnregister { method: String },
    /// Invoke a scoped method on whichever connection serves it.
    RpcCall {
        ack_id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Reply to an [`ServerMessage::RpcRequest`].
    RpcResponse { request_id: String, result: String },
    Ping,
}

/// Frame sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Result of a request carrying `ack_id`.
    Ack { ack_id: String, result: Value },
    /// A call forwarded to the owner of `method`.
    RpcRequest {
        request_id: String,
        method: String,
        params: String,
    },
    RpcRegistered { method: String },
    /// Change notification for subscribed viewers.
    Update { event: SyncEvent },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_heartbeat_frames() {
        let frame: ClientMessage =
            serde_json::from_str(r#"{"type":"session-alive","sid":"s1","time":10,"thinking":true}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientMessage::SessionAlive(SessionAlive {
                sid: "s1".into(),
                time: 10,
                thinking: true
            })
        );

        let frame: ClientMessage =
            serde_json::from_str(r#"{"type":"machine-alive","machineId":"m1","time":3}"#).unwrap();
        assert!(matches!(frame, ClientMessage::MachineAlive(a) if a.machine_id == "m1"));
    }

    #[test]
    fn test_update_frame_field_names() {
        let frame = ClientMessage::UpdateState {
            ack_id: "a1".into(),
            sid: "s1".into(),
            agent_state: None,
            expected_version: 4,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "update-state",
                "ackId": "a1",
                "sid": "s1",
                "agentState": null,
                "expectedVersion": 4
            })
        );
    }

    #[test]
    fn test_rpc_request_frame() {
        let frame = ServerMessage::RpcRequest {
            request_id: "r1".into(),
            method: "sess1:bash".into(),
            params: "{}".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "rpc-request");
        assert_eq!(value["requestId"], "r1");
    }

    #[test]
    fn test_create_machine_frame() {
        let frame: ClientMessage = serde_json::from_str(
            r#"{"type":"create-machine","machineId":"m1","metadata":{"host":"box"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientMessage::CreateMachine {
                ack_id: None,
                machine_id: "m1".into(),
                metadata: json!({"host": "box"}),
                daemon_state: None
            }
        );
    }

    #[test]
    fn test_message_optional_fields() {
        let frame: ClientMessage =
            serde_json::from_str(r#"{"type":"message","sid":"s1","content":{"text":"hi"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientMessage::Message {
                ack_id: None,
                sid: "s1".into(),
                content: json!({"text": "hi"}),
                local_id: None
            }
        );
    }
}
