//! Lenient typed views over opaque metadata payloads.
//!
//! Stored payloads are free-form JSON. These views pick out the fields this
//! workspace reads and keep everything else in `extra`, so a value written by
//! a newer client survives a read-modify-write by an older one.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Session metadata as reported by the agent runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Machine metadata as reported by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single entry of a session's todo snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    #[serde(default = "default_todo_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_todo_status() -> String {
    "pending".to_string()
}

/// Parse a payload into a typed view, returning `None` when the shape does
/// not fit instead of failing the caller.
#[must_use]
pub fn parse_lenient<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::debug!(error = %e, "payload did not match expected shape");
            None
        }
    }
}

impl SessionMetadata {
    /// Read the typed view of a session metadata payload.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        parse_lenient(value)
    }
}

impl MachineMetadata {
    /// Read the typed view of a machine metadata payload.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        parse_lenient(value)
    }
}
