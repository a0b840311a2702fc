//! The wire message envelope.
//!
//! Every frame exchanged between the two peers is one JSON-encoded
//! [`Message`]:
//!
//! ```text
//! { id, type, action, payload, timestamp, source, target,
//!   priority, requiresResponse, correlationId? }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{PING_ACTION, PONG_ACTION};
use crate::errors::BridgeError;
use crate::ids::MessageId;

/// Kind of message carried by the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Incremental application data.
    DataUpdate,
    /// Instruction for the remote peer.
    Command,
    /// Out-of-band notification.
    SystemEvent,
    /// Liveness probe (`ping`) or its reply (`pong`).
    Heartbeat,
    /// Request for the peer to resend its full state.
    SyncRequest,
    /// Reply resolving a correlated request.
    Acknowledgment,
}

/// Delivery priority.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// User-visible traffic.
    High,
    /// Fast-pathed past tick batching in low-latency mode.
    Critical,
}

/// One unit of communication between the peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique per bridge instance.
    pub id: MessageId,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Payload-specific verb.
    pub action: String,
    /// Opaque application data.
    #[serde(default)]
    pub payload: Value,
    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
    /// Logical sender endpoint.
    pub source: String,
    /// Logical receiver endpoint (may be the broadcast target).
    pub target: String,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Whether the receiver should acknowledge this message.
    #[serde(default)]
    pub requires_response: bool,
    /// Links a reply to the request it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
}

impl Message {
    /// Create a message stamped with a fresh ID and the current time.
    pub fn new(
        kind: MessageType,
        action: impl Into<String>,
        payload: Value,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            action: action.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
            target: target.into(),
            priority: Priority::default(),
            requires_response: false,
            correlation_id: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Key under which a reply to this message is correlated: the explicit
    /// correlation ID when present, otherwise the message ID.
    pub fn correlation_key(&self) -> &MessageId {
        self.correlation_id.as_ref().unwrap_or(&self.id)
    }

    /// Build the acknowledgment answering this message.
    ///
    /// The reply carries the same correlation key and swaps source and target.
    pub fn acknowledgment(&self, payload: Value) -> Self {
        Self::new(
            MessageType::Acknowledgment,
            self.action.clone(),
            payload,
            self.target.clone(),
            self.source.clone(),
        )
        .with_priority(self.priority)
        .with_correlation(self.correlation_key().clone())
    }

    /// Build a heartbeat probe.
    pub fn ping(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(MessageType::Heartbeat, PING_ACTION, Value::Null, source, target)
            .with_priority(Priority::High)
    }

    /// Build the heartbeat reply for this probe.
    pub fn pong(&self) -> Self {
        Self::new(
            MessageType::Heartbeat,
            PONG_ACTION,
            Value::Null,
            self.target.clone(),
            self.source.clone(),
        )
        .with_priority(Priority::High)
        .with_correlation(self.id.clone())
    }

    /// Whether this is a heartbeat probe.
    pub fn is_ping(&self) -> bool {
        self.kind == MessageType::Heartbeat && self.action == PING_ACTION
    }

    /// Whether this is a heartbeat reply.
    pub fn is_pong(&self) -> bool {
        self.kind == MessageType::Heartbeat && self.action == PONG_ACTION
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Serialization(e.to_string()))
    }

    /// Decode a wire frame.
    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(text).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
    }
}

/// Caller-supplied part of a message. The bridge stamps ID, timestamp,
/// source and (when absent) target.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDraft {
    /// Message kind.
    pub kind: MessageType,
    /// Payload-specific verb.
    pub action: String,
    /// Opaque application data.
    pub payload: Value,
    /// Explicit target; the bridge's remote endpoint when `None`.
    pub target: Option<String>,
    /// Delivery priority.
    pub priority: Priority,
}

impl MessageDraft {
    /// Start a draft with a null payload and default priority.
    pub fn new(kind: MessageType, action: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            payload: Value::Null,
            target: None,
            priority: Priority::default(),
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set an explicit target.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Stamp the draft into a full message.
    pub fn into_message(self, source: &str, default_target: &str) -> Message {
        let target = self.target.unwrap_or_else(|| default_target.to_owned());
        Message::new(self.kind, self.action, self.payload, source, target)
            .with_priority(self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sample() -> Message {
        Message::new(
            MessageType::DataUpdate,
            "cursor.move",
            json!({"x": 1}),
            "editor",
            "viewer",
        )
    }

    #[test]
    fn wire_field_names() {
        let msg = sample().with_correlation(MessageId::from("msg_req"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "data-update");
        assert_eq!(value["action"], "cursor.move");
        assert_eq!(value["priority"], "medium");
        assert_eq!(value["requiresResponse"], false);
        assert_eq!(value["correlationId"], "msg_req");
        assert!(value["timestamp"].is_i64());
        assert_eq!(value["source"], "editor");
        assert_eq!(value["target"], "viewer");
    }

    #[test]
    fn correlation_id_omitted_when_absent() {
        let value = serde_json::to_value(sample()).unwrap();
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn type_names() {
        let names = [
            (MessageType::DataUpdate, "data-update"),
            (MessageType::Command, "command"),
            (MessageType::SystemEvent, "system-event"),
            (MessageType::Heartbeat, "heartbeat"),
            (MessageType::SyncRequest, "sync-request"),
            (MessageType::Acknowledgment, "acknowledgment"),
        ];
        for (kind, name) in names {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(name));
        }
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn decode_minimal_frame_uses_defaults() {
        let text = r#"{"id":"msg_1","type":"command","action":"reload","timestamp":1,"source":"a","target":"b"}"#;
        let msg = Message::from_json(text).unwrap();
        assert_eq!(msg.kind, MessageType::Command);
        assert_eq!(msg.priority, Priority::Medium);
        assert!(!msg.requires_response);
        assert!(msg.payload.is_null());
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn decode_garbage_is_invalid_message() {
        assert_matches!(Message::from_json("not json"), Err(BridgeError::InvalidMessage(_)));
        assert_matches!(
            Message::from_json(r#"{"id":"x","type":"bogus"}"#),
            Err(BridgeError::InvalidMessage(_))
        );
    }

    #[test]
    fn acknowledgment_swaps_endpoints_and_correlates() {
        let request = sample().with_priority(Priority::High);
        let ack = request.acknowledgment(json!({"ok": true}));
        assert_eq!(ack.kind, MessageType::Acknowledgment);
        assert_eq!(ack.source, "viewer");
        assert_eq!(ack.target, "editor");
        assert_eq!(ack.correlation_id.as_ref(), Some(&request.id));
        assert_eq!(ack.priority, Priority::High);
        assert_ne!(ack.id, request.id);
    }

    #[test]
    fn acknowledgment_keeps_existing_correlation() {
        let request = sample().with_correlation(MessageId::from("msg_origin"));
        let ack = request.acknowledgment(Value::Null);
        assert_eq!(ack.correlation_id, Some(MessageId::from("msg_origin")));
    }

    #[test]
    fn ping_pong_pairing() {
        let ping = Message::ping("local", "remote");
        assert!(ping.is_ping());
        assert!(!ping.is_pong());
        let pong = ping.pong();
        assert!(pong.is_pong());
        assert_eq!(pong.correlation_id.as_ref(), Some(&ping.id));
        assert_eq!(pong.source, "remote");
        assert_eq!(pong.target, "local");
    }

    #[test]
    fn draft_stamps_defaults() {
        let msg = MessageDraft::new(MessageType::Command, "open")
            .payload(json!({"path": "/"}))
            .priority(Priority::Critical)
            .into_message("local", "remote");
        assert_eq!(msg.source, "local");
        assert_eq!(msg.target, "remote");
        assert_eq!(msg.priority, Priority::Critical);
        assert_eq!(msg.payload["path"], "/");
    }

    #[test]
    fn draft_explicit_target_wins() {
        let msg = MessageDraft::new(MessageType::SystemEvent, "theme")
            .target("broadcast")
            .into_message("local", "remote");
        assert_eq!(msg.target, "broadcast");
    }
}
