use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use super::{
    Acknowledger, InboundMessage, MessageBus, MessagingError, OutboundMessage, Subscription, Topic,
};
use crate::context::RequestContext;

// ============================================================================
// In-Memory Message Bus
// ============================================================================
//
// Single-process bus used when no brokers are configured, and as the bus
// fake in tests:
// - publishing to a topic records the message and fans it out to every
//   subscription bound to that topic
// - every ack/nack is kept in a ledger
// - a nacked message is redelivered until max_delivery_attempts, then it
//   moves to the dead-letter list
//
// Published messages, the ledger and dead letters keep only the most recent
// history_capacity entries each.
//
// ============================================================================

const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;
const DEFAULT_HISTORY_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub id: String,
    pub topic: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Nacked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub message_id: String,
    pub subscription: String,
    pub delivery_attempt: u32,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone)]
struct Delivery {
    id: String,
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    attempt: u32,
}

struct SubscriptionState {
    topic: String,
    sender: Option<mpsc::UnboundedSender<Delivery>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

#[derive(Default)]
struct BusState {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionState>,
    published: VecDeque<PublishedMessage>,
    ledger: VecDeque<AckRecord>,
    dead_letters: VecDeque<(String, Delivery)>,
    published_total: usize,
    settled_total: usize,
    publish_failure: Option<String>,
    publish_latency: Option<Duration>,
    next_message_id: u64,
}

impl BusState {
    fn mint_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("mem-{}", self.next_message_id)
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, capacity: usize, entry: T) {
    if capacity == 0 {
        return;
    }
    while history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(entry);
}

struct Shared {
    state: Mutex<BusState>,
    published_notify: Notify,
    settled_notify: Notify,
    max_delivery_attempts: u32,
    history_capacity: usize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, subscription: &str, delivery: Delivery, outcome: DeliveryOutcome) {
        let mut state = self.state();
        let record = AckRecord {
            message_id: delivery.id.clone(),
            subscription: subscription.to_string(),
            delivery_attempt: delivery.attempt,
            outcome,
        };
        push_bounded(&mut state.ledger, self.history_capacity, record);
        state.settled_total += 1;

        if outcome == DeliveryOutcome::Nacked {
            let sender = state
                .subscriptions
                .get(subscription)
                .and_then(|s| s.sender.clone());

            match sender {
                Some(sender) if delivery.attempt < self.max_delivery_attempts => {
                    let redelivery = Delivery {
                        attempt: delivery.attempt + 1,
                        ..delivery
                    };
                    if let Err(mpsc::error::SendError(lost)) = sender.send(redelivery) {
                        push_bounded(
                            &mut state.dead_letters,
                            self.history_capacity,
                            (subscription.to_string(), lost),
                        );
                    }
                }
                _ => {
                    tracing::warn!(
                        subscription = %subscription,
                        message_id = %delivery.id,
                        attempts = delivery.attempt,
                        "Message exhausted its deliveries, moved to dead letters"
                    );
                    push_bounded(
                        &mut state.dead_letters,
                        self.history_capacity,
                        (subscription.to_string(), delivery),
                    );
                }
            }
        }

        drop(state);
        self.settled_notify.notify_waiters();
    }
}

struct InMemoryAcknowledger {
    shared: Arc<Shared>,
    subscription: String,
    delivery: Delivery,
}

impl Acknowledger for InMemoryAcknowledger {
    fn ack(self: Box<Self>) {
        let this = *self;
        this.shared
            .settle(&this.subscription, this.delivery, DeliveryOutcome::Acked);
    }

    fn nack(self: Box<Self>) {
        let this = *self;
        this.shared
            .settle(&this.subscription, this.delivery, DeliveryOutcome::Nacked);
    }
}

#[derive(Clone)]
pub struct InMemoryMessageBus {
    shared: Arc<Shared>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::with_max_delivery_attempts(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_delivery_attempts(max_delivery_attempts: u32) -> Self {
        Self::with_limits(max_delivery_attempts, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_limits(max_delivery_attempts: u32, history_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                published_notify: Notify::new(),
                settled_notify: Notify::new(),
                max_delivery_attempts: max_delivery_attempts.max(1),
                history_capacity,
            }),
        }
    }

    /// Bus with the order lifecycle topics and subscriptions already in place
    pub fn with_order_topology(
        approval_subscription: &str,
        approval_topic: &str,
        rejection_subscription: &str,
        rejection_topic: &str,
    ) -> Self {
        let bus = Self::new();
        bus.add_order_topology(approval_subscription, approval_topic, rejection_subscription, rejection_topic);
        bus
    }

    pub fn add_order_topology(
        &self,
        approval_subscription: &str,
        approval_topic: &str,
        rejection_subscription: &str,
        rejection_topic: &str,
    ) {
        use crate::domain::order::{ORDER_CREATED_TOPIC, ORDER_STATUS_CHANGED_TOPIC};

        self.create_topic(ORDER_CREATED_TOPIC);
        self.create_topic(ORDER_STATUS_CHANGED_TOPIC);
        self.create_subscription(approval_subscription, approval_topic);
        self.create_subscription(rejection_subscription, rejection_topic);
    }

    pub fn create_topic(&self, name: &str) {
        self.shared.state().topics.insert(name.to_string());
    }

    /// Creates the topic too when it does not exist yet
    pub fn create_subscription(&self, name: &str, topic: &str) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.shared.state();
        state.topics.insert(topic.to_string());
        state.subscriptions.insert(
            name.to_string(),
            SubscriptionState {
                topic: topic.to_string(),
                sender: Some(sender),
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            },
        );
    }

    /// Pending messages stay receivable; afterwards `receive` returns `None`
    pub fn close_subscription(&self, name: &str) {
        if let Some(subscription) = self.shared.state().subscriptions.get_mut(name) {
            subscription.sender = None;
        }
    }

    /// Put a message straight onto one subscription, bypassing its topic
    pub fn deliver(
        &self,
        subscription: &str,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<String, MessagingError> {
        let mut state = self.shared.state();
        let id = state.mint_id();
        let sender = state
            .subscriptions
            .get(subscription)
            .and_then(|s| s.sender.clone())
            .ok_or_else(|| MessagingError::SubscriptionNotFound(subscription.to_string()))?;

        sender
            .send(Delivery {
                id: id.clone(),
                data,
                attributes,
                attempt: 1,
            })
            .map_err(|_| MessagingError::SubscriptionNotFound(subscription.to_string()))?;

        Ok(id)
    }

    /// Make every publish fail with `reason` until cleared with `None`
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.shared.state().publish_failure = reason.map(str::to_string);
    }

    pub fn set_publish_latency(&self, latency: Option<Duration>) {
        self.shared.state().publish_latency = latency;
    }

    pub fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        self.shared
            .state()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of published messages still held in the history
    pub fn publish_count(&self) -> usize {
        self.shared.state().published.len()
    }

    pub fn acknowledgements(&self) -> Vec<AckRecord> {
        self.shared.state().ledger.iter().cloned().collect()
    }

    pub fn dead_letter_count(&self, subscription: &str) -> usize {
        self.shared
            .state()
            .dead_letters
            .iter()
            .filter(|(name, _)| name == subscription)
            .count()
    }

    /// Wait until at least `count` messages were published in total
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.shared.published_notify, timeout, || {
            self.shared.state().published_total >= count
        })
        .await
    }

    /// Wait until at least `count` acks/nacks were recorded in total
    pub async fn wait_for_acknowledgements(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.shared.settled_notify, timeout, || {
            self.shared.state().settled_total >= count
        })
        .await
    }
}

async fn wait_until(notify: &Notify, timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if condition() {
            return true;
        }
        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return condition();
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn get_topic(&self, _ctx: &RequestContext, name: &str) -> Result<Topic, MessagingError> {
        if self.shared.state().topics.contains(name) {
            Ok(Topic::new(name))
        } else {
            Err(MessagingError::TopicNotFound(name.to_string()))
        }
    }

    async fn publish(&self, topic: &Topic, message: OutboundMessage) -> Result<String, MessagingError> {
        let latency = self.shared.state().publish_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let id = {
            let mut state = self.shared.state();

            if let Some(reason) = state.publish_failure.clone() {
                return Err(MessagingError::PublishFailed {
                    topic: topic.name().to_string(),
                    reason,
                });
            }
            if !state.topics.contains(topic.name()) {
                return Err(MessagingError::TopicNotFound(topic.name().to_string()));
            }

            let id = state.mint_id();
            for subscription in state.subscriptions.values() {
                if subscription.topic != topic.name() {
                    continue;
                }
                if let Some(sender) = &subscription.sender {
                    let _ = sender.send(Delivery {
                        id: id.clone(),
                        data: message.data.clone(),
                        attributes: message.attributes.clone(),
                        attempt: 1,
                    });
                }
            }

            let published = PublishedMessage {
                id: id.clone(),
                topic: topic.name().to_string(),
                message,
            };
            push_bounded(&mut state.published, self.shared.history_capacity, published);
            state.published_total += 1;
            id
        };

        self.shared.published_notify.notify_waiters();
        Ok(id)
    }

    async fn get_subscription(
        &self,
        _ctx: &RequestContext,
        name: &str,
    ) -> Result<Subscription, MessagingError> {
        self.shared
            .state()
            .subscriptions
            .get(name)
            .map(|s| Subscription::new(name, s.topic.clone()))
            .ok_or_else(|| MessagingError::SubscriptionNotFound(name.to_string()))
    }

    async fn receive(&self, subscription: &Subscription) -> Result<Option<InboundMessage>, MessagingError> {
        let receiver = self
            .shared
            .state()
            .subscriptions
            .get(subscription.name())
            .map(|s| s.receiver.clone())
            .ok_or_else(|| MessagingError::SubscriptionNotFound(subscription.name().to_string()))?;

        let delivery = {
            let mut receiver = receiver.lock().await;
            // mpsc::recv is cancel safe, so a dropped receive loses nothing
            match receiver.recv().await {
                Some(delivery) => delivery,
                None => return Ok(None),
            }
        };

        Ok(Some(InboundMessage::new(
            delivery.id.clone(),
            delivery.data.clone(),
            delivery.attributes.clone(),
            delivery.attempt,
            Box::new(InMemoryAcknowledger {
                shared: self.shared.clone(),
                subscription: subscription.name().to_string(),
                delivery,
            }),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    fn bus() -> InMemoryMessageBus {
        let bus = InMemoryMessageBus::with_max_delivery_attempts(2);
        bus.create_topic("orderCreated");
        bus.create_subscription("approveOrder", "orderApproved");
        bus
    }

    #[tokio::test]
    async fn test_get_unknown_topic_fails() {
        let err = bus()
            .get_topic(&RequestContext::background(), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_records_message() {
        let bus = bus();
        let topic = bus
            .get_topic(&RequestContext::background(), "orderCreated")
            .await
            .unwrap();

        let id = bus
            .publish(&topic, OutboundMessage::new(vec![1]).with_attribute("host", "h1"))
            .await
            .unwrap();

        let published = bus.published("orderCreated");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, id);
        assert_eq!(published[0].message.attributes["host"], "h1");
        assert!(bus.wait_for_published(1, WAIT).await);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_bound_subscriptions() {
        let bus = bus();
        let ctx = RequestContext::background();
        let topic = bus.get_topic(&ctx, "orderApproved").await.unwrap();
        let subscription = bus.get_subscription(&ctx, "approveOrder").await.unwrap();
        assert_eq!(subscription.topic(), "orderApproved");

        bus.publish(&topic, OutboundMessage::new(vec![7])).await.unwrap();

        let msg = bus.receive(&subscription).await.unwrap().unwrap();
        assert_eq!(msg.data(), &[7]);
        msg.ack();
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let bus = bus();
        let topic = Topic::new("orderCreated");
        bus.fail_publishes(Some("broker down"));

        let err = bus.publish(&topic, OutboundMessage::new(vec![])).await.unwrap_err();
        assert!(matches!(err, MessagingError::PublishFailed { .. }));
        assert_eq!(bus.publish_count(), 0);

        bus.fail_publishes(None);
        assert!(bus.publish(&topic, OutboundMessage::new(vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_is_recorded() {
        let bus = bus();
        let subscription = Subscription::new("approveOrder", "orderApproved");
        let id = bus.deliver("approveOrder", vec![1], HashMap::new()).unwrap();

        bus.receive(&subscription).await.unwrap().unwrap().ack();

        assert!(bus.wait_for_acknowledgements(1, WAIT).await);
        let ledger = bus.acknowledgements();
        assert_eq!(ledger[0].message_id, id);
        assert_eq!(ledger[0].outcome, DeliveryOutcome::Acked);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let bus = bus();
        let subscription = Subscription::new("approveOrder", "orderApproved");
        bus.deliver("approveOrder", vec![1], HashMap::new()).unwrap();

        let first = bus.receive(&subscription).await.unwrap().unwrap();
        assert_eq!(first.delivery_attempt(), 1);
        first.nack();

        let second = bus.receive(&subscription).await.unwrap().unwrap();
        assert_eq!(second.delivery_attempt(), 2);
        second.nack();

        assert_eq!(bus.dead_letter_count("approveOrder"), 1);
        let outcomes: Vec<_> = bus.acknowledgements().iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![DeliveryOutcome::Nacked, DeliveryOutcome::Nacked]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = InMemoryMessageBus::with_limits(1, 3);
        bus.create_subscription("approveOrder", "orderApproved");
        let topic = Topic::new("orderApproved");
        let subscription = Subscription::new("approveOrder", "orderApproved");

        for i in 0..10u8 {
            bus.publish(&topic, OutboundMessage::new(vec![i])).await.unwrap();
            bus.receive(&subscription).await.unwrap().unwrap().nack();
        }

        assert_eq!(bus.publish_count(), 3);
        let kept: Vec<u8> = bus
            .published("orderApproved")
            .iter()
            .map(|p| p.message.data[0])
            .collect();
        assert_eq!(kept, vec![7, 8, 9]);
        assert_eq!(bus.acknowledgements().len(), 3);
        assert_eq!(bus.dead_letter_count("approveOrder"), 3);

        // Waiters count every publish, not just the retained ones
        assert!(bus.wait_for_published(10, WAIT).await);
        assert!(bus.wait_for_acknowledgements(10, WAIT).await);
    }

    #[tokio::test]
    async fn test_long_running_publisher_stays_within_capacity() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic("orderCreated");
        let topic = Topic::new("orderCreated");

        for _ in 0..(DEFAULT_HISTORY_CAPACITY * 3) {
            bus.publish(&topic, OutboundMessage::new(vec![0])).await.unwrap();
        }

        assert_eq!(bus.publish_count(), DEFAULT_HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn test_closed_subscription_returns_none() {
        let bus = bus();
        let subscription = Subscription::new("approveOrder", "orderApproved");
        bus.deliver("approveOrder", vec![1], HashMap::new()).unwrap();
        bus.close_subscription("approveOrder");

        // Pending message is still delivered before the close is observed
        bus.receive(&subscription).await.unwrap().unwrap().ack();
        assert!(bus.receive(&subscription).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_is_cancel_safe() {
        let bus = bus();
        let subscription = Subscription::new("approveOrder", "orderApproved");

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), bus.receive(&subscription)).await;
        assert!(timed_out.is_err());

        bus.deliver("approveOrder", vec![3], HashMap::new()).unwrap();
        let msg = bus.receive(&subscription).await.unwrap().unwrap();
        assert_eq!(msg.data(), &[3]);
        msg.ack();
    }
}
