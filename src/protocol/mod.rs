//! Wire protocol for the duplex sync channel.
//!
//! Frames are self-describing JSON text messages carrying a stable integer
//! `type` field. Receivers must tolerate unknown type ids so that new
//! message kinds can roll out client-first.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Maximum inbound frame size (512 KiB). Larger frames are a protocol
/// violation and close the connection.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Per-connection outbound queue depth. Overflow drops the frame for that
/// recipient only.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Typed message kinds. The integer ids are wire-stable; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Heartbeat,
    HeartbeatAck,
    SnapshotRequest,
    SnapshotResponse,
    StateUpdate,
    Error,
    Auth,
    AuthSuccess,
    AuthFailure,
    DeviceJoined,
    DeviceLeft,
    DeviceList,
    Broadcast,
    AdminUpdate,
}

impl MessageType {
    /// Map a wire id to a known type. Unknown ids return `None` and are
    /// handled (logged and ignored) by the dispatcher.
    pub fn from_id(id: i64) -> Option<MessageType> {
        match id {
            1 => Some(MessageType::Heartbeat),
            2 => Some(MessageType::HeartbeatAck),
            3 => Some(MessageType::SnapshotRequest),
            4 => Some(MessageType::SnapshotResponse),
            5 => Some(MessageType::StateUpdate),
            6 => Some(MessageType::Error),
            7 => Some(MessageType::Auth),
            8 => Some(MessageType::AuthSuccess),
            9 => Some(MessageType::AuthFailure),
            10 => Some(MessageType::DeviceJoined),
            11 => Some(MessageType::DeviceLeft),
            12 => Some(MessageType::DeviceList),
            13 => Some(MessageType::Broadcast),
            14 => Some(MessageType::AdminUpdate),
            _ => None,
        }
    }

    pub fn id(self) -> i64 {
        match self {
            MessageType::Heartbeat => 1,
            MessageType::HeartbeatAck => 2,
            MessageType::SnapshotRequest => 3,
            MessageType::SnapshotResponse => 4,
            MessageType::StateUpdate => 5,
            MessageType::Error => 6,
            MessageType::Auth => 7,
            MessageType::AuthSuccess => 8,
            MessageType::AuthFailure => 9,
            MessageType::DeviceJoined => 10,
            MessageType::DeviceLeft => 11,
            MessageType::DeviceList => 12,
            MessageType::Broadcast => 13,
            MessageType::AdminUpdate => 14,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "Heartbeat",
            MessageType::HeartbeatAck => "HeartbeatAck",
            MessageType::SnapshotRequest => "SnapshotRequest",
            MessageType::SnapshotResponse => "SnapshotResponse",
            MessageType::StateUpdate => "StateUpdate",
            MessageType::Error => "Error",
            MessageType::Auth => "Auth",
            MessageType::AuthSuccess => "AuthSuccess",
            MessageType::AuthFailure => "AuthFailure",
            MessageType::DeviceJoined => "DeviceJoined",
            MessageType::DeviceLeft => "DeviceLeft",
            MessageType::DeviceList => "DeviceList",
            MessageType::Broadcast => "Broadcast",
            MessageType::AdminUpdate => "AdminUpdate",
        }
    }
}

/// A single frame on the duplex channel.
///
/// `kind` is kept as the raw wire id rather than `MessageType` so that
/// frames with unknown ids still deserialize and can be skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
}

impl Message {
    /// Build a frame of the given type with a JSON object payload.
    pub fn build(kind: MessageType, payload: Value) -> Message {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Message {
            kind: kind.id(),
            session_id: String::new(),
            user_id: String::new(),
            device_id: String::new(),
            timestamp: Utc::now().timestamp(),
            payload,
            correlation_id: String::new(),
        }
    }

    /// Build an `Error` frame. `details` must never carry secrets, tokens,
    /// or backend error text.
    pub fn error(code: i64, message: &str, details: &str) -> Message {
        Message::build(
            MessageType::Error,
            json!({
                "code": code,
                "message": message,
                "details": details,
            }),
        )
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_id(self.kind)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(|v| v.as_bool())
    }

    /// Serialize for the transport. Serialization of a value built from
    /// plain maps and strings cannot fail; fall back to an empty object
    /// rather than panicking.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ids_are_stable() {
        assert_eq!(MessageType::Heartbeat.id(), 1);
        assert_eq!(MessageType::Auth.id(), 7);
        assert_eq!(MessageType::AdminUpdate.id(), 14);
        for id in 1..=14 {
            let ty = MessageType::from_id(id).unwrap();
            assert_eq!(ty.id(), id);
        }
    }

    #[test]
    fn test_unknown_id_is_none() {
        assert!(MessageType::from_id(0).is_none());
        assert!(MessageType::from_id(99).is_none());
        assert!(MessageType::from_id(-1).is_none());
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = Message::build(MessageType::StateUpdate, json!({"key": "x", "value": 1}));
        let wire = msg.to_wire();
        let parsed: Message = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.kind, MessageType::StateUpdate.id());
        assert_eq!(parsed.payload_str("key"), Some("x"));
    }

    #[test]
    fn test_unknown_type_still_parses() {
        let parsed: Message =
            serde_json::from_str(r#"{"type": 42, "timestamp": 0, "payload": {"a": 1}}"#).unwrap();
        assert_eq!(parsed.kind, 42);
        assert!(parsed.message_type().is_none());
    }

    #[test]
    fn test_error_frame_shape() {
        let msg = Message::error(401, "Invalid token", "");
        assert_eq!(msg.message_type(), Some(MessageType::Error));
        assert_eq!(msg.payload.get("code"), Some(&json!(401)));
        assert_eq!(msg.payload_str("message"), Some("Invalid token"));
    }

    #[test]
    fn test_empty_fields_omitted_on_wire() {
        let msg = Message::build(MessageType::Heartbeat, json!({}));
        let wire = msg.to_wire();
        assert!(!wire.contains("session_id"));
        assert!(!wire.contains("correlation_id"));
    }
}
