// ============================================================================
// Messaging - publish/subscribe contract for order lifecycle events
// ============================================================================
//
// The orchestrator only sees the MessageBus trait:
// - get_topic / publish         (publish awaits broker confirmation; callers
//                                that must not block spawn it)
// - get_subscription / receive  (every InboundMessage is acked or nacked
//                                exactly once; both consume the message)
//
// Adapters:
// - redpanda: Kafka-protocol bus (rdkafka) with circuit breaker
// - memory:   in-process bus with ack ledger and bounded redelivery
//
// ============================================================================

mod memory;
mod redpanda;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::context::RequestContext;

pub use memory::{AckRecord, DeliveryOutcome, InMemoryMessageBus, PublishedMessage};
pub use redpanda::{DeadLetter, RedpandaConfig, RedpandaMessageBus};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("topic {0} not found")]
    TopicNotFound(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("failed to publish to {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("failed to receive from {subscription}: {reason}")]
    ReceiveFailed { subscription: String, reason: String },

    #[error("message bus unavailable: {0}")]
    Unavailable(String),
}

/// Handle to an existing topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    name: String,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to an existing subscription and the topic it is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: String,
    topic: String,
}

impl Subscription {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Payload plus string attributes, ready to publish
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Messages sharing a key keep their relative order where the bus supports it
    pub ordering_key: Option<String>,
}

impl OutboundMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

/// Settles a received message with the bus
pub trait Acknowledger: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

pub struct InboundMessage {
    id: String,
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    delivery_attempt: u32,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl InboundMessage {
    pub fn new(
        id: impl Into<String>,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
        delivery_attempt: u32,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: id.into(),
            data,
            attributes,
            delivery_attempt,
            acknowledger: Some(acknowledger),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// Mark as processed; the bus will not deliver it again
    pub fn ack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.ack();
        }
    }

    /// Mark as failed; the bus may deliver it again
    pub fn nack(mut self) {
        if let Some(acknowledger) = self.acknowledger.take() {
            acknowledger.nack();
        }
    }
}

impl Drop for InboundMessage {
    fn drop(&mut self) {
        if self.acknowledger.is_some() {
            tracing::warn!(
                message_id = %self.id,
                "Message dropped without ack or nack, leaving redelivery to the bus"
            );
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("bytes", &self.data.len())
            .field("attributes", &self.attributes)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish()
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn get_topic(&self, ctx: &RequestContext, name: &str) -> Result<Topic, MessagingError>;

    /// Publish and wait for the broker's confirmation, returning the message id
    async fn publish(&self, topic: &Topic, message: OutboundMessage) -> Result<String, MessagingError>;

    async fn get_subscription(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Subscription, MessagingError>;

    /// Wait for the next message. `Ok(None)` means the subscription is closed.
    /// Must be cancel-safe: dropping the future loses no message.
    async fn receive(&self, subscription: &Subscription) -> Result<Option<InboundMessage>, MessagingError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingAcknowledger {
        outcomes: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Acknowledger for RecordingAcknowledger {
        fn ack(self: Box<Self>) {
            self.outcomes.lock().unwrap().push("ack");
        }

        fn nack(self: Box<Self>) {
            self.outcomes.lock().unwrap().push("nack");
        }
    }

    fn message(outcomes: &Arc<Mutex<Vec<&'static str>>>) -> InboundMessage {
        let mut attributes = HashMap::new();
        attributes.insert("correlation-id".to_string(), "abc".to_string());
        InboundMessage::new(
            "m-1",
            vec![1, 2, 3],
            attributes,
            1,
            Box::new(RecordingAcknowledger {
                outcomes: outcomes.clone(),
            }),
        )
    }

    #[test]
    fn test_ack_settles_once() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let msg = message(&outcomes);
        assert_eq!(msg.attribute("correlation-id"), Some("abc"));
        assert_eq!(msg.data(), &[1, 2, 3]);
        msg.ack();
        assert_eq!(*outcomes.lock().unwrap(), vec!["ack"]);
    }

    #[test]
    fn test_nack_settles_once() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        message(&outcomes).nack();
        assert_eq!(*outcomes.lock().unwrap(), vec!["nack"]);
    }

    #[test]
    fn test_drop_without_settling_records_nothing() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        drop(message(&outcomes));
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outbound_message_builder() {
        let msg = OutboundMessage::new(vec![9])
            .with_attribute("service", "orders")
            .with_ordering_key("42");
        assert_eq!(msg.attributes.get("service").map(String::as_str), Some("orders"));
        assert_eq!(msg.ordering_key.as_deref(), Some("42"));
    }
}
