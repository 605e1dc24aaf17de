//! Message router — dispatches inbound messages to handlers by type.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::identity::NodeId;
use crate::message::{CapabilityPayload, HealthPayload, Message, MessageType};
use crate::registry::NodeRegistry;

/// A handler that processes a message and optionally returns a reply,
/// which is sent back on the same connection.
pub type MessageHandler =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = Option<Message>> + Send>> + Send + Sync>;

/// Routes inbound messages to the handler registered for their
/// [`MessageType`].
#[derive(Clone)]
pub struct MessageRouter {
    handlers: HashMap<MessageType, MessageHandler>,
    default_handler: Option<MessageHandler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: None,
        }
    }

    /// Register a handler, replacing any earlier one for the same type.
    pub fn register(&mut self, message_type: MessageType, handler: MessageHandler) {
        debug!("Registering handler for {message_type}");
        self.handlers.insert(message_type, handler);
    }

    /// Register a fallback for types without a specific handler.
    pub fn set_default_handler(&mut self, handler: MessageHandler) {
        self.default_handler = Some(handler);
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Look up the handler for `message_type`, falling back to the default.
    pub fn handler_for(&self, message_type: MessageType) -> Option<MessageHandler> {
        self.handlers
            .get(&message_type)
            .or(self.default_handler.as_ref())
            .cloned()
    }

    /// Dispatch a message to its handler and return the reply, if any.
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        match self.handler_for(message.message_type) {
            Some(handler) => {
                debug!("Dispatching {} message {}", message.message_type, message.id);
                handler(message).await
            }
            None => {
                warn!("No handler for {} message from {}", message.message_type, message.sender);
                None
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in handler factories
// ---------------------------------------------------------------------------

/// Answer health pings with a pong echoing the ping's send time.
pub fn health_handler(local_id: NodeId) -> MessageHandler {
    Arc::new(move |message: Message| {
        let local_id = local_id.clone();
        Box::pin(async move {
            let sent_at = match message.parse_payload::<HealthPayload>() {
                Ok(HealthPayload::Ping { sent_at }) => sent_at,
                Ok(HealthPayload::Pong { .. }) => return None,
                Err(e) => {
                    warn!("Malformed health probe from {}: {e}", message.sender);
                    Utc::now()
                }
            };
            Message::typed(
                MessageType::Health,
                &HealthPayload::Pong { sent_at },
                local_id,
                Some(message.sender),
            )
            .ok()
        })
    })
}

/// Record capability advertisements from known nodes.
pub fn capability_handler(registry: NodeRegistry) -> MessageHandler {
    Arc::new(move |message: Message| {
        let registry = registry.clone();
        Box::pin(async move {
            match message.parse_payload::<CapabilityPayload>() {
                Ok(payload) => {
                    let count = payload.capabilities.len();
                    if registry.update_capabilities(message.sender.as_str(), payload.capabilities) {
                        debug!("Node {} now advertises {count} capabilities", message.sender);
                    } else {
                        debug!("Capabilities from unregistered node {} ignored", message.sender);
                    }
                }
                Err(e) => warn!("Malformed capability payload from {}: {e}", message.sender),
            }
            None
        })
    })
}

/// Log messages nobody registered a handler for.
pub fn unhandled_handler() -> MessageHandler {
    Arc::new(|message: Message| {
        Box::pin(async move {
            debug!(
                "Dropping {} message {} from {}: no handler",
                message.message_type, message.id, message.sender
            );
            None
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn make_message(message_type: MessageType, payload: serde_json::Value) -> Message {
        Message::new(
            message_type,
            payload,
            NodeId::from_string("test-sender"),
            Some(NodeId::from_string("test-receiver")),
        )
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let mut router = MessageRouter::new();

        let handler: MessageHandler = Arc::new(|msg: Message| {
            Box::pin(async move {
                Some(Message::new(
                    MessageType::Data,
                    serde_json::json!({"echo": msg.payload}),
                    NodeId::from_string("responder"),
                    Some(msg.sender),
                ))
            })
        });

        router.register(MessageType::Data, handler);
        assert!(router.has_handler(MessageType::Data));
        assert_eq!(router.handler_count(), 1);

        let reply = router
            .dispatch(make_message(MessageType::Data, serde_json::json!("hi")))
            .await
            .unwrap();
        assert_eq!(reply.payload["echo"], "hi");
        assert_eq!(reply.recipient, Some(NodeId::from_string("test-sender")));
    }

    #[tokio::test]
    async fn test_unhandled_message() {
        let router = MessageRouter::new();
        let reply = router
            .dispatch(make_message(MessageType::State, serde_json::json!({})))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_default_handler() {
        let mut router = MessageRouter::new();
        let default: MessageHandler = Arc::new(|msg: Message| {
            Box::pin(async move {
                Some(Message::new(
                    MessageType::Data,
                    serde_json::json!({"fallback": true}),
                    NodeId::from_string("default"),
                    Some(msg.sender),
                ))
            })
        });
        router.set_default_handler(default);

        let reply = router
            .dispatch(make_message(MessageType::Capability, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(reply.payload["fallback"], true);
    }

    #[tokio::test]
    async fn test_health_handler_pongs() {
        let handler = health_handler(NodeId::from_string("our-node"));
        let sent_at = Utc::now();
        let ping = make_message(
            MessageType::Health,
            serde_json::to_value(HealthPayload::Ping { sent_at }).unwrap(),
        );

        let reply = handler(ping).await.unwrap();
        assert_eq!(reply.message_type, MessageType::Health);
        assert_eq!(reply.sender, NodeId::from_string("our-node"));
        match reply.parse_payload::<HealthPayload>().unwrap() {
            HealthPayload::Pong { sent_at: echoed } => assert_eq!(echoed, sent_at),
            other => panic!("Expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capability_handler_updates_registry() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("test-sender"), "127.0.0.1", 9000, BTreeSet::new());
        let handler = capability_handler(registry.clone());

        let msg = make_message(
            MessageType::Capability,
            serde_json::json!({"capabilities": ["search", "summarize"]}),
        );
        assert!(handler(msg).await.is_none());
        assert_eq!(registry.get("test-sender").unwrap().capabilities.len(), 2);
    }
}
