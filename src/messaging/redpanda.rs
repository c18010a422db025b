use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    Acknowledger, InboundMessage, MessageBus, MessagingError, OutboundMessage, Subscription, Topic,
};
use crate::context::RequestContext;
use crate::utils::{retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, RetryConfig};

// ============================================================================
// Redpanda Message Bus (Kafka protocol via rdkafka)
// ============================================================================
//
// - Topic:        Kafka topic, existence checked through cluster metadata
// - Attributes:   Kafka record headers
// - Publish:      FutureProducer behind a circuit breaker
// - Subscription: consumer group named after the subscription, bound to a
//                 topic (configurable, defaults to the subscription name)
// - Ack:          commit offset + 1 for the record's partition
// - Nack:         seek the partition back to the record so it is redelivered,
//                 after a backoff, until redelivery.max_attempts deliveries;
//                 then commit past it and keep it as a dead letter
//
// ============================================================================

const MESSAGE_ID_HEADER: &str = "message-id";

#[derive(Debug, Clone)]
pub struct RedpandaConfig {
    pub brokers: String,
    pub message_timeout: Duration,
    pub metadata_timeout: Duration,
    pub subscription_topics: HashMap<String, String>,
    pub metadata_retry: RetryConfig,
    /// max_attempts bounds deliveries of one record; delays space redeliveries
    pub redelivery: RetryConfig,
    pub dead_letter_capacity: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl RedpandaConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            message_timeout: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(5),
            subscription_topics: HashMap::new(),
            metadata_retry: RetryConfig::default(),
            redelivery: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            },
            dead_letter_capacity: 1_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_subscription_topics(mut self, bindings: HashMap<String, String>) -> Self {
        self.subscription_topics = bindings;
        self
    }

    pub fn with_max_delivery_attempts(mut self, max_attempts: u32) -> Self {
        self.redelivery.max_attempts = max_attempts.max(1);
        self
    }

    fn topic_for(&self, subscription: &str) -> String {
        self.subscription_topics
            .get(subscription)
            .cloned()
            .unwrap_or_else(|| subscription.to_string())
    }
}

pub struct RedpandaMessageBus {
    config: RedpandaConfig,
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    consumers: Mutex<HashMap<String, Arc<StreamConsumer>>>,
    deliveries: Arc<StdMutex<DeliveryTracker>>,
}

impl RedpandaMessageBus {
    pub fn new(config: RedpandaConfig) -> Result<Self, MessagingError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout.as_millis().to_string())
            .create()
            .map_err(|e| MessagingError::Unavailable(format!("failed to create producer: {}", e)))?;

        let circuit_breaker = CircuitBreaker::new("redpanda", config.circuit_breaker.clone());
        let deliveries = DeliveryTracker::new(config.redelivery.max_attempts, config.dead_letter_capacity);

        tracing::info!(brokers = %config.brokers, "✅ Redpanda producer created");

        Ok(Self {
            config,
            producer,
            circuit_breaker,
            consumers: Mutex::new(HashMap::new()),
            deliveries: Arc::new(StdMutex::new(deliveries)),
        })
    }

    /// Records given up on after exhausting their deliveries, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.deliveries).dead_letters.iter().cloned().collect()
    }

    /// Whether the cluster knows `topic`, retried on transient metadata failures
    async fn topic_exists(&self, topic: &str) -> Result<bool, MessagingError> {
        retry_with_backoff(&self.config.metadata_retry, "fetch_topic_metadata", |_| {
            let producer = self.producer.clone();
            let topic = topic.to_string();
            let timeout = self.config.metadata_timeout;

            async move {
                // fetch_metadata blocks the calling thread
                tokio::task::spawn_blocking(move || -> Result<bool, MessagingError> {
                    let metadata = producer
                        .client()
                        .fetch_metadata(Some(topic.as_str()), Timeout::After(timeout))
                        .map_err(|e| MessagingError::Unavailable(e.to_string()))?;

                    Ok(metadata
                        .topics()
                        .iter()
                        .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty()))
                })
                .await
                .map_err(|e| MessagingError::Unavailable(e.to_string()))?
            }
        })
        .await
    }

    fn create_consumer(&self, subscription: &str, topic: &str) -> Result<StreamConsumer, MessagingError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", subscription)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| MessagingError::Unavailable(format!("failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::ReceiveFailed {
                subscription: subscription.to_string(),
                reason: e.to_string(),
            })?;

        Ok(consumer)
    }
}

fn headers_from(attributes: &HashMap<String, String>, message_id: &str) -> OwnedHeaders {
    attributes.iter().fold(
        OwnedHeaders::new().insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id),
        }),
        |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        },
    )
}

fn attributes_from(message: &OwnedMessage) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                attributes.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    attributes
}

// ============================================================================
// Delivery tracking
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    topic: String,
    partition: i32,
    offset: i64,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub delivery_attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NackDecision {
    Redeliver,
    GiveUp { attempts: u32 },
}

/// Delivery counts per record, plus the bounded dead-letter history
#[derive(Debug)]
struct DeliveryTracker {
    max_attempts: u32,
    attempts: HashMap<RecordKey, u32>,
    dead_letters: VecDeque<DeadLetter>,
    dead_letter_capacity: usize,
}

impl DeliveryTracker {
    fn new(max_attempts: u32, dead_letter_capacity: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: HashMap::new(),
            dead_letters: VecDeque::new(),
            dead_letter_capacity,
        }
    }

    /// Count one more delivery of `key` and return its attempt number
    fn delivered(&mut self, key: &RecordKey) -> u32 {
        let attempts = self.attempts.entry(key.clone()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    fn acked(&mut self, key: &RecordKey) {
        self.attempts.remove(key);
    }

    fn nacked(&mut self, key: &RecordKey, message_id: &str) -> NackDecision {
        let attempts = self.attempts.get(key).copied().unwrap_or(1);
        if attempts < self.max_attempts {
            return NackDecision::Redeliver;
        }

        self.attempts.remove(key);
        if self.dead_letter_capacity > 0 {
            if self.dead_letters.len() == self.dead_letter_capacity {
                self.dead_letters.pop_front();
            }
            self.dead_letters.push_back(DeadLetter {
                message_id: message_id.to_string(),
                topic: key.topic.clone(),
                partition: key.partition,
                offset: key.offset,
                delivery_attempts: attempts,
                dead_lettered_at: Utc::now(),
            });
        }
        NackDecision::GiveUp { attempts }
    }
}

fn lock(tracker: &StdMutex<DeliveryTracker>) -> MutexGuard<'_, DeliveryTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

struct KafkaAcknowledger {
    consumer: Arc<StreamConsumer>,
    deliveries: Arc<StdMutex<DeliveryTracker>>,
    message_id: String,
    key: RecordKey,
}

impl KafkaAcknowledger {
    fn commit_past(&self) {
        let mut offsets = TopicPartitionList::new();
        let committed = offsets
            .add_partition_offset(&self.key.topic, self.key.partition, Offset::Offset(self.key.offset + 1))
            .and_then(|_| self.consumer.commit(&offsets, CommitMode::Async));

        if let Err(e) = committed {
            tracing::error!(
                topic = %self.key.topic,
                partition = self.key.partition,
                offset = self.key.offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}

impl Acknowledger for KafkaAcknowledger {
    fn ack(self: Box<Self>) {
        lock(&self.deliveries).acked(&self.key);
        self.commit_past();
    }

    fn nack(self: Box<Self>) {
        let decision = lock(&self.deliveries).nacked(&self.key, &self.message_id);

        match decision {
            NackDecision::Redeliver => {
                let seeked = self.consumer.seek(
                    &self.key.topic,
                    self.key.partition,
                    Offset::Offset(self.key.offset),
                    Timeout::After(Duration::from_secs(1)),
                );

                if let Err(e) = seeked {
                    tracing::error!(
                        topic = %self.key.topic,
                        partition = self.key.partition,
                        offset = self.key.offset,
                        error = %e,
                        "Failed to rewind partition for redelivery"
                    );
                }
            }
            NackDecision::GiveUp { attempts } => {
                tracing::error!(
                    message_id = %self.message_id,
                    topic = %self.key.topic,
                    partition = self.key.partition,
                    offset = self.key.offset,
                    attempts = attempts,
                    "☠️ Delivery attempts exhausted, message dead-lettered"
                );
                self.commit_past();
            }
        }
    }
}

#[async_trait]
impl MessageBus for RedpandaMessageBus {
    async fn get_topic(&self, ctx: &RequestContext, name: &str) -> Result<Topic, MessagingError> {
        let exists = ctx
            .scope(self.topic_exists(name))
            .await
            .map_err(|e| MessagingError::Unavailable(e.to_string()))??;

        if exists {
            Ok(Topic::new(name))
        } else {
            Err(MessagingError::TopicNotFound(name.to_string()))
        }
    }

    async fn publish(&self, topic: &Topic, message: OutboundMessage) -> Result<String, MessagingError> {
        let message_id = uuid::Uuid::now_v7().to_string();
        let headers = headers_from(&message.attributes, &message_id);

        let result = self
            .circuit_breaker
            .call(async {
                let mut record = FutureRecord::to(topic.name())
                    .payload(&message.data)
                    .headers(headers);
                if let Some(key) = &message.ordering_key {
                    record = record.key(key);
                }

                self.producer
                    .send(record, Timeout::After(self.config.message_timeout))
                    .await
                    .map_err(|(e, _)| e)
            })
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(topic = %topic.name(), message_id = %message_id, "Published to Redpanda");
                Ok(message_id)
            }
            Err(CircuitBreakerError::Open(circuit)) => Err(MessagingError::Unavailable(format!(
                "circuit {} open, Redpanda unavailable",
                circuit
            ))),
            Err(CircuitBreakerError::Failed(e)) => Err(MessagingError::PublishFailed {
                topic: topic.name().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn get_subscription(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Subscription, MessagingError> {
        let topic = self.config.topic_for(name);

        let exists = ctx
            .scope(self.topic_exists(&topic))
            .await
            .map_err(|e| MessagingError::Unavailable(e.to_string()))??;
        if !exists {
            return Err(MessagingError::SubscriptionNotFound(format!(
                "{} (topic {} does not exist)",
                name, topic
            )));
        }

        let mut consumers = self.consumers.lock().await;
        if !consumers.contains_key(name) {
            let consumer = self.create_consumer(name, &topic)?;
            consumers.insert(name.to_string(), Arc::new(consumer));
            tracing::info!(subscription = %name, topic = %topic, "Consumer group joined");
        }

        Ok(Subscription::new(name, topic))
    }

    async fn receive(&self, subscription: &Subscription) -> Result<Option<InboundMessage>, MessagingError> {
        let consumer = self
            .consumers
            .lock()
            .await
            .get(subscription.name())
            .cloned()
            .ok_or_else(|| MessagingError::SubscriptionNotFound(subscription.name().to_string()))?;

        let message = consumer
            .recv()
            .await
            .map_err(|e| MessagingError::ReceiveFailed {
                subscription: subscription.name().to_string(),
                reason: e.to_string(),
            })?
            .detach();

        let attributes = attributes_from(&message);
        let id = attributes
            .get(MESSAGE_ID_HEADER)
            .cloned()
            .unwrap_or_else(|| format!("{}/{}/{}", message.topic(), message.partition(), message.offset()));

        let key = RecordKey {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        let attempt = lock(&self.deliveries).delivered(&key);
        if attempt > 1 {
            let delay = self.config.redelivery.delay_after(attempt - 1);
            tracing::debug!(message_id = %id, attempt = attempt, delay_ms = delay.as_millis() as u64, "Redelivering");
            tokio::time::sleep(delay).await;
        }

        let acknowledger = KafkaAcknowledger {
            consumer,
            deliveries: Arc::clone(&self.deliveries),
            message_id: id.clone(),
            key,
        };

        Ok(Some(InboundMessage::new(
            id,
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attributes,
            attempt,
            Box::new(acknowledger),
        )))
    }
}
