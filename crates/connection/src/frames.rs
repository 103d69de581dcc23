//! Home Assistant WebSocket protocol frames
//!
//! The upstream protocol is a JSON frame stream after authentication.
//! Outgoing frames are built with `serde_json::json!`; inbound frames
//! deserialize into [`ServerFrame`].

use serde::Deserialize;
use serde_json::{json, Value};

/// Inbound frames from Home Assistant
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth_required")]
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    #[serde(rename = "auth_ok")]
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    #[serde(rename = "auth_invalid")]
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "result")]
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(rename = "event")]
    Event { id: u64, event: Value },
    #[serde(rename = "ping")]
    Ping { id: u64 },
    #[serde(rename = "pong")]
    Pong { id: u64 },
    #[serde(other)]
    Other,
}

/// `{type: "auth", access_token: …}`
pub fn auth_frame(access_token: &str) -> Value {
    json!({"type": "auth", "access_token": access_token})
}

/// `{id, type: "ping"}`
pub fn ping_frame(id: u64) -> Value {
    json!({"id": id, "type": "ping"})
}

/// `{id, type: "pong"}` (reply to a server-initiated ping)
pub fn pong_frame(id: u64) -> Value {
    json!({"id": id, "type": "pong"})
}

/// `{id, type: "subscribe_events", event_type}`
pub fn subscribe_events_frame(id: u64, event_type: &str) -> Value {
    json!({"id": id, "type": "subscribe_events", "event_type": event_type})
}

/// `{id, type: <command>}` for plain listing commands
pub fn command_frame(id: u64, command: &str) -> Value {
    json!({"id": id, "type": command})
}
