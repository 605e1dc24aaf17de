//! Network message protocol — typed, immutable message envelopes.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// The type tag of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Application data exchanged between agents.
    Data,
    /// Capability advertisement.
    Capability,
    /// Two-phase state synchronization.
    State,
    /// Presence announcement.
    Discovery,
    /// Health probe and its reply.
    Health,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "DATA",
            Self::Capability => "CAPABILITY",
            Self::State => "STATE",
            Self::Discovery => "DISCOVERY",
            Self::Health => "HEALTH",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network message. Constructed once and never mutated; every outbound
/// copy is encrypted independently by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID v4).
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub sender: NodeId,
    /// Target node. `None` means broadcast.
    pub recipient: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        payload: serde_json::Value,
        sender: NodeId,
        recipient: Option<NodeId>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            payload,
            sender,
            recipient,
            timestamp: Utc::now(),
        }
    }

    /// Build a message from a typed payload.
    pub fn typed<T: Serialize>(
        message_type: MessageType,
        payload: &T,
        sender: NodeId,
        recipient: Option<NodeId>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            message_type,
            serde_json::to_value(payload)?,
            sender,
            recipient,
        ))
    }

    /// Create a broadcast message (recipient = None).
    pub fn broadcast(message_type: MessageType, payload: serde_json::Value, sender: NodeId) -> Self {
        Self::new(message_type, payload, sender, None)
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Decode the payload into a typed value.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// What actually travels (encrypted) on the wire: the message plus the
/// sender's optional auth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub message: Message,
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// A presence announcement carried by `DISCOVERY` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
}

/// Body of a `HEALTH` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthPayload {
    Ping { sent_at: DateTime<Utc> },
    Pong { sent_at: DateTime<Utc> },
}

/// Body of a `CAPABILITY` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityPayload {
    pub capabilities: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::new(
            MessageType::Data,
            serde_json::json!({"task": "summarize"}),
            NodeId::from_string("agent-a"),
            Some(NodeId::from_string("agent-b")),
        );

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "DATA");
        assert_eq!(value["sender"], "agent-a");
        assert_eq!(value["recipient"], "agent-b");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_broadcast_has_no_recipient() {
        let msg = Message::broadcast(
            MessageType::Discovery,
            serde_json::json!({}),
            NodeId::from_string("agent-a"),
        );
        assert!(msg.is_broadcast());
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_typed_payload() {
        let announcement = Announcement {
            node_id: NodeId::from_string("agent-a"),
            host: "127.0.0.1".to_string(),
            port: 9470,
            capabilities: ["search".to_string()].into_iter().collect(),
        };
        let msg = Message::typed(
            MessageType::Discovery,
            &announcement,
            NodeId::from_string("agent-a"),
            None,
        )
        .unwrap();

        let parsed: Announcement = msg.parse_payload().unwrap();
        assert_eq!(parsed, announcement);
    }

    #[test]
    fn test_health_payload_tagging() {
        let ping = HealthPayload::Ping { sent_at: Utc::now() };
        let value = serde_json::to_value(&ping).unwrap();
        assert_eq!(value["kind"], "ping");
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::Capability.to_string(), "CAPABILITY");
        let parsed: MessageType = serde_json::from_str("\"HEALTH\"").unwrap();
        assert_eq!(parsed, MessageType::Health);
    }
}
