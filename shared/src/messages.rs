//! Wire message model for supervisor <-> worker communication
//!
//! Every message on the channel is a framed UTF-8 JSON object with the fields
//! `messageId`, `messageType`, `payload`, and `timestamp`. When a peer omits
//! the id or timestamp they are synthesized locally on receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved message type for protocol-level liveness probes.
pub const HEARTBEAT_MESSAGE_TYPE: &str = "heartbeat";

/// Message type used for caller-submitted payloads.
pub const DATA_MESSAGE_TYPE: &str = "data";

/// A message exchanged between the supervisor and one worker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default = "synthesize_message_id")]
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn synthesize_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl WireMessage {
    /// Builds a message with a caller-provided id and a fresh timestamp.
    pub fn with_id(
        message_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Builds a message with a synthesized id and a fresh timestamp.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self::with_id(synthesize_message_id(), message_type, payload)
    }

    /// Builds a protocol heartbeat with the conventional `"ping"` payload.
    pub fn heartbeat(message_id: impl Into<String>) -> Self {
        Self::with_id(
            message_id,
            HEARTBEAT_MESSAGE_TYPE,
            Value::String("ping".to_string()),
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == HEARTBEAT_MESSAGE_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_field_names() {
        let message = WireMessage::with_id("msg-1-1", "data", json!({"k": "v"}));
        let encoded = serde_json::to_string(&message).unwrap();

        assert!(encoded.contains("\"messageId\":\"msg-1-1\""));
        assert!(encoded.contains("\"messageType\":\"data\""));
        assert!(encoded.contains("\"payload\""));
        assert!(encoded.contains("\"timestamp\""));
    }

    #[test]
    fn test_missing_id_and_timestamp_are_synthesized() {
        let decoded: WireMessage =
            serde_json::from_str(r#"{"messageType":"data","payload":42}"#).unwrap();

        assert!(!decoded.message_id.is_empty());
        assert_eq!(decoded.message_type, "data");
        assert_eq!(decoded.payload, json!(42));
        assert!(decoded.timestamp <= Utc::now());
    }

    #[test]
    fn test_heartbeat_detection() {
        let hb = WireMessage::heartbeat("msg-1-2");
        assert!(hb.is_heartbeat());
        assert_eq!(hb.payload, json!("ping"));

        let data = WireMessage::new("data", json!(null));
        assert!(!data.is_heartbeat());
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let message = WireMessage::with_id("msg-9-3", "result", json!({"ok": true}));
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(message, decoded);
    }
}
