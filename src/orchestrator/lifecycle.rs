use prost::Message;
use std::sync::Arc;
use std::time::Instant;

use crate::config::EventConfig;
use crate::context::{RequestContext, ShutdownSignal, CORRELATION_ID_KEY};
use crate::domain::order::{
    Order, OrderError, OrderStatus, StatusChange, HOST_ATTRIBUTE, ORDER_CREATED_TOPIC,
    ORDER_STATUS_CHANGED_TOPIC, SERVICE_ATTRIBUTE,
};
use crate::messaging::{InboundMessage, MessageBus, MessagingError, OutboundMessage, Subscription};
use crate::metrics::Metrics;
use crate::repository::OrderRepository;
use crate::rpc::{from_domain, proto};
use crate::utils::retry_with_backoff;

// ============================================================================
// Order Lifecycle Orchestrator
// ============================================================================
//
// Request path:
//   place_order          → quantity check → repository.create (deadline)
//                        → spawn orderCreated + orderStatusChanged
//   update_order_status  → empty check → repository.update (deadline)
//                        → spawn orderStatusChanged
//
// Event path (one long-lived task each):
//   handle_order_approval / handle_order_rejection
//                        → receive → decode → update_order_status → ack/nack
//
// Publications run on their own task with a detached context, so they
// neither delay nor get cancelled with the request that caused them.
//
// ============================================================================

#[derive(Clone)]
pub struct OrderLifecycleOrchestrator {
    repository: Arc<dyn OrderRepository>,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<Metrics>,
    config: Arc<EventConfig>,
}

impl OrderLifecycleOrchestrator {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<Metrics>,
        config: EventConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            metrics,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    // ========================================================================
    // Request path
    // ========================================================================

    pub async fn place_order(&self, ctx: &RequestContext, mut order: Order) -> Result<Order, OrderError> {
        if let Some(item) = order.items.iter().find(|item| item.quantity <= 0) {
            let err = OrderError::InvalidQuantity {
                sku: item.name.clone(),
                quantity: item.quantity,
            };
            self.metrics.record_placement_failure(err.reason());
            return Err(err);
        }

        order.status = OrderStatus::New.to_string();

        let created = self.create_within_deadline(ctx, order).await.inspect_err(|e| {
            tracing::error!(
                correlation_id = ctx.correlation_id().unwrap_or_default(),
                error = %e,
                "Failed to persist order"
            );
            self.metrics.record_placement_failure(e.reason());
        })?;

        self.metrics.record_order_placed();

        let ctx = ctx.clone().ensure_correlation_id();
        tracing::info!(
            order_id = created.id.unwrap_or_default(),
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            items = created.items.len(),
            "✅ Order placed"
        );

        self.spawn_publication(&ctx, created.clone(), Publication::Created);
        self.spawn_publication(&ctx, created.clone(), Publication::StatusChanged);

        Ok(created)
    }

    pub async fn update_order_status(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        status: &str,
    ) -> Result<Order, OrderError> {
        if status.trim().is_empty() {
            self.metrics.record_status_update("invalid_status");
            return Err(OrderError::InvalidStatus(status.to_string()));
        }

        if status.parse::<OrderStatus>().is_err() {
            tracing::warn!(
                order_id = order_id,
                status = %status,
                "Status is not a known lifecycle label, storing it as given"
            );
        }

        let updated = self
            .update_within_deadline(ctx, order_id, status)
            .await
            .inspect_err(|e| self.metrics.record_status_update(e.reason()))?;

        self.metrics.record_status_update("updated");

        let ctx = ctx.clone().ensure_correlation_id();
        tracing::info!(
            order_id = order_id,
            status = %updated.status,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            "Order status changed"
        );

        self.spawn_publication(&ctx, updated.clone(), Publication::StatusChanged);

        Ok(updated)
    }

    async fn create_within_deadline(&self, ctx: &RequestContext, order: Order) -> Result<Order, OrderError> {
        Ok(ctx.scope(self.repository.create(ctx, order)).await??)
    }

    async fn update_within_deadline(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        status: &str,
    ) -> Result<Order, OrderError> {
        Ok(ctx
            .scope(self.repository.update_order_status(ctx, order_id, status))
            .await??)
    }

    // ========================================================================
    // Publications
    // ========================================================================

    fn spawn_publication(&self, ctx: &RequestContext, order: Order, publication: Publication) {
        let orchestrator = self.clone();
        let ctx = ctx.detached(self.config.publish_timeout);

        tokio::spawn(async move {
            match publication {
                Publication::Created => orchestrator.publish_order_created_event(&ctx, &order).await,
                Publication::StatusChanged => orchestrator.publish_order_status_changed(&ctx, &order).await,
            }
        });
    }

    /// Publish the full order to `orderCreated`. Failures are logged only.
    pub async fn publish_order_created_event(&self, ctx: &RequestContext, order: &Order) {
        let payload = from_domain(order).encode_to_vec();
        self.publish(ctx, ORDER_CREATED_TOPIC, payload, order.id).await;
    }

    /// Publish `{order id, status}` to `orderStatusChanged`. Failures are logged only.
    pub async fn publish_order_status_changed(&self, ctx: &RequestContext, order: &Order) {
        let payload = proto::OrderStatus::from(StatusChange::from(order)).encode_to_vec();
        self.publish(ctx, ORDER_STATUS_CHANGED_TOPIC, payload, order.id).await;
    }

    async fn publish(&self, ctx: &RequestContext, topic_name: &str, payload: Vec<u8>, order_id: Option<i64>) {
        let ctx = ctx.clone().ensure_correlation_id();
        let correlation_id = ctx.correlation_id().unwrap_or_default().to_string();

        let mut message = OutboundMessage::new(payload)
            .with_attribute(CORRELATION_ID_KEY, correlation_id.as_str())
            .with_attribute(SERVICE_ATTRIBUTE, self.config.service_name.as_str())
            .with_attribute(HOST_ATTRIBUTE, self.config.host.as_str());
        if let Some(id) = order_id {
            message = message.with_ordering_key(id.to_string());
        }

        let started = Instant::now();
        let outcome = ctx
            .scope(async {
                let topic = self.bus.get_topic(&ctx, topic_name).await?;
                self.bus.publish(&topic, message).await
            })
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(message_id)) => {
                self.metrics.record_publish(topic_name, elapsed, true);
                tracing::info!(
                    topic = %topic_name,
                    message_id = %message_id,
                    order_id = order_id.unwrap_or_default(),
                    correlation_id = %correlation_id,
                    "📤 Published order event"
                );
            }
            Ok(Err(e)) => {
                self.metrics.record_publish(topic_name, elapsed, false);
                tracing::error!(
                    topic = %topic_name,
                    order_id = order_id.unwrap_or_default(),
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to publish order event"
                );
            }
            Err(deadline) => {
                self.metrics.record_publish(topic_name, elapsed, false);
                tracing::error!(
                    topic = %topic_name,
                    order_id = order_id.unwrap_or_default(),
                    correlation_id = %correlation_id,
                    error = %deadline,
                    "Publishing order event timed out"
                );
            }
        }
    }

    // ========================================================================
    // Consumption loops
    // ========================================================================

    /// Apply approvals from the approval subscription until shutdown
    pub async fn handle_order_approval(&self, shutdown: ShutdownSignal) -> Result<(), MessagingError> {
        let subscription = self.config.approval_subscription.clone();
        self.consume_status_changes(&subscription, shutdown).await
    }

    /// Apply rejections from the rejection subscription until shutdown
    pub async fn handle_order_rejection(&self, shutdown: ShutdownSignal) -> Result<(), MessagingError> {
        let subscription = self.config.rejection_subscription.clone();
        self.consume_status_changes(&subscription, shutdown).await
    }

    async fn consume_status_changes(
        &self,
        subscription_name: &str,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), MessagingError> {
        let ctx = RequestContext::background();

        let acquired = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            acquired = retry_with_backoff(&self.config.subscription_retry, "get_subscription", |_| {
                self.bus.get_subscription(&ctx, subscription_name)
            }) => acquired,
        };

        let subscription = acquired.inspect_err(|e| {
            tracing::error!(
                subscription = %subscription_name,
                error = %e,
                "Cannot handle lifecycle events at the moment"
            );
        })?;

        tracing::info!(
            subscription = %subscription.name(),
            topic = %subscription.topic(),
            "👂 Listening for order lifecycle events"
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                received = self.bus.receive(&subscription) => received,
            };

            match received {
                Ok(Some(message)) => self.process_status_message(&subscription, message).await,
                Ok(None) => {
                    tracing::warn!(subscription = %subscription.name(), "Subscription closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        subscription = %subscription.name(),
                        error = %e,
                        "Failed to receive message, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.triggered() => break,
                        _ = tokio::time::sleep(self.config.receive_retry_delay) => {}
                    }
                }
            }
        }

        tracing::info!(subscription = %subscription.name(), "Stopped listening");
        Ok(())
    }

    /// Decode one `{order id, status}` instruction and apply it. The message
    /// is acked only when the status update succeeded.
    async fn process_status_message(&self, subscription: &Subscription, message: InboundMessage) {
        tracing::debug!(
            subscription = %subscription.name(),
            message_id = %message.id(),
            attempt = message.delivery_attempt(),
            "Received lifecycle message"
        );

        let instruction = match proto::OrderStatus::decode(message.data()) {
            Ok(instruction) => StatusChange::from(instruction),
            Err(e) => {
                tracing::warn!(
                    subscription = %subscription.name(),
                    message_id = %message.id(),
                    error = %e,
                    "Failed to decode order status, nacking"
                );
                message.nack();
                self.metrics.record_consumed(subscription.name(), "nacked");
                return;
            }
        };

        let mut ctx = RequestContext::background().with_timeout(self.config.handler_timeout);
        if let Some(correlation_id) = message.attribute(CORRELATION_ID_KEY) {
            ctx = ctx.with_correlation_id(correlation_id);
        }

        match self
            .update_order_status(&ctx, instruction.order_id, &instruction.status)
            .await
        {
            Ok(_) => {
                message.ack();
                self.metrics.record_consumed(subscription.name(), "acked");
            }
            Err(e) => {
                tracing::warn!(
                    subscription = %subscription.name(),
                    message_id = %message.id(),
                    order_id = instruction.order_id,
                    correlation_id = ctx.correlation_id().unwrap_or_default(),
                    error = %e,
                    "Failed to apply lifecycle message, nacking"
                );
                message.nack();
                self.metrics.record_consumed(subscription.name(), "nacked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Publication {
    Created,
    StatusChanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::shutdown_channel;
    use crate::domain::order::{OrderedItem, APPROVE_ORDER_SUBSCRIPTION, REJECT_ORDER_SUBSCRIPTION};
    use crate::messaging::{DeliveryOutcome, InMemoryMessageBus};
    use crate::repository::InMemoryOrderRepository;
    use std::collections::HashMap;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);
    // Long enough for a spawned publication to have run
    const SETTLE: Duration = Duration::from_millis(50);

    struct Fixture {
        orchestrator: OrderLifecycleOrchestrator,
        repository: Arc<InMemoryOrderRepository>,
        bus: InMemoryMessageBus,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(InMemoryOrderRepository::new());
        let bus = InMemoryMessageBus::with_order_topology(
            APPROVE_ORDER_SUBSCRIPTION,
            APPROVE_ORDER_SUBSCRIPTION,
            REJECT_ORDER_SUBSCRIPTION,
            REJECT_ORDER_SUBSCRIPTION,
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = EventConfig {
            service_name: "orders-service".to_string(),
            host: "test-host".to_string(),
            publish_timeout: Duration::from_millis(500),
            ..EventConfig::default()
        };

        Fixture {
            orchestrator: OrderLifecycleOrchestrator::new(
                repository.clone(),
                Arc::new(bus.clone()),
                metrics.clone(),
                config,
            ),
            repository,
            bus,
            metrics,
        }
    }

    fn pepsi(quantity: i32) -> Order {
        Order::new(1, 1, 10.0, vec![OrderedItem::new(1, quantity, 1.0, "Pepsi")])
    }

    fn status_message(order_id: i64, status: &str) -> Vec<u8> {
        proto::OrderStatus {
            order_id,
            status: status.to_string(),
        }
        .encode_to_vec()
    }

    // ========================================================================
    // place_order
    // ========================================================================

    #[tokio::test]
    async fn test_place_order_persists_and_publishes_both_events() {
        let f = fixture();

        let placed = f
            .orchestrator
            .place_order(&RequestContext::background(), pepsi(10))
            .await
            .unwrap();

        assert_eq!(placed.id, Some(1));
        assert_eq!(placed.items.len(), 1);
        assert_eq!(placed.grand_total, 10.0);
        assert_eq!(placed.status, "New");

        assert!(f.bus.wait_for_published(2, WAIT).await);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(f.bus.published(ORDER_CREATED_TOPIC).len(), 1);
        assert_eq!(f.bus.published(ORDER_STATUS_CHANGED_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_place_order_forces_new_status() {
        let f = fixture();
        let mut order = pepsi(10);
        order.status = "Delivered".to_string();

        let placed = f
            .orchestrator
            .place_order(&RequestContext::background(), order)
            .await
            .unwrap();

        assert_eq!(placed.status, "New");
    }

    #[tokio::test]
    async fn test_created_event_carries_persisted_order_and_attributes() {
        let f = fixture();
        let ctx = RequestContext::background().with_correlation_id("corr-1");

        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();
        assert!(f.bus.wait_for_published(2, WAIT).await);

        let created_events = f.bus.published(ORDER_CREATED_TOPIC);
        let created = &created_events[0].message;
        let wire = proto::Order::decode(created.data.as_slice()).unwrap();
        assert_eq!(wire.order_id, 1);
        assert_eq!(wire.items[0].name, "Pepsi");
        assert_eq!(created.attributes[CORRELATION_ID_KEY], "corr-1");
        assert_eq!(created.attributes[SERVICE_ATTRIBUTE], "orders-service");
        assert_eq!(created.attributes[HOST_ATTRIBUTE], "test-host");

        let changed_events = f.bus.published(ORDER_STATUS_CHANGED_TOPIC);
        let changed = &changed_events[0].message;
        let status = proto::OrderStatus::decode(changed.data.as_slice()).unwrap();
        assert_eq!(status.order_id, 1);
        assert_eq!(status.status, "New");
    }

    #[tokio::test]
    async fn test_place_order_mints_correlation_id_when_absent() {
        let f = fixture();

        f.orchestrator
            .place_order(&RequestContext::background(), pepsi(10))
            .await
            .unwrap();
        assert!(f.bus.wait_for_published(2, WAIT).await);

        let created = f.bus.published(ORDER_CREATED_TOPIC);
        let changed = f.bus.published(ORDER_STATUS_CHANGED_TOPIC);
        let minted = &created[0].message.attributes[CORRELATION_ID_KEY];
        assert!(!minted.is_empty());
        assert_eq!(&changed[0].message.attributes[CORRELATION_ID_KEY], minted);
    }

    #[tokio::test]
    async fn test_non_positive_quantity_is_rejected_before_persisting() {
        let f = fixture();

        let err = f
            .orchestrator
            .place_order(&RequestContext::background(), pepsi(-10))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::InvalidQuantity { .. }));
        let message = err.to_string();
        assert!(message.contains("Pepsi"));
        assert!(message.contains("-10"));
        assert_eq!(f.repository.create_calls(), 0);

        tokio::time::sleep(SETTLE).await;
        assert_eq!(f.bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_repository_failure_is_surfaced_without_publishing() {
        let f = fixture();
        f.repository.inject_failure(Some("connection reset"));

        let err = f
            .orchestrator
            .place_order(&RequestContext::background(), pepsi(10))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::Repository(_)));
        tokio::time::sleep(SETTLE).await;
        assert_eq!(f.bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_repository_call_is_bounded_by_request_deadline() {
        let f = fixture();
        f.repository.set_latency(Some(Duration::from_millis(200)));
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(20));

        let err = f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap_err();

        assert!(matches!(err, OrderError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_placement() {
        let f = fixture();
        f.bus.fail_publishes(Some("broker down"));

        let placed = f
            .orchestrator
            .place_order(&RequestContext::background(), pepsi(10))
            .await;

        assert!(placed.is_ok());
        tokio::time::sleep(SETTLE).await;
        assert_eq!(f.bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_publish_does_not_delay_placement() {
        let f = fixture();
        f.bus.set_publish_latency(Some(Duration::from_millis(300)));

        let placed = tokio::time::timeout(
            Duration::from_millis(100),
            f.orchestrator.place_order(&RequestContext::background(), pepsi(10)),
        )
        .await;

        assert!(placed.unwrap().is_ok());
        assert_eq!(f.bus.publish_count(), 0);
        assert!(f.bus.wait_for_published(2, WAIT).await);
    }

    #[tokio::test]
    async fn test_publication_outlives_expired_request_deadline() {
        let f = fixture();
        f.bus.set_publish_latency(Some(Duration::from_millis(50)));
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(30));

        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();

        assert!(f.bus.wait_for_published(2, WAIT).await);
    }

    #[tokio::test]
    async fn test_placement_metrics() {
        let f = fixture();
        let ctx = RequestContext::background();

        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();
        let _ = f.orchestrator.place_order(&ctx, pepsi(0)).await;

        assert_eq!(f.metrics.orders_placed.get(), 1);
        assert_eq!(
            f.metrics
                .order_placement_failures
                .with_label_values(&["invalid_quantity"])
                .get(),
            1
        );
    }

    // ========================================================================
    // update_order_status
    // ========================================================================

    #[tokio::test]
    async fn test_update_status_publishes_with_correlation_id() {
        let f = fixture();
        f.orchestrator
            .place_order(&RequestContext::background(), pepsi(10))
            .await
            .unwrap();
        assert!(f.bus.wait_for_published(2, WAIT).await);

        let ctx = RequestContext::background().with_correlation_id("approve-1");
        let updated = f
            .orchestrator
            .update_order_status(&ctx, 1, "Approved")
            .await
            .unwrap();

        assert_eq!(updated.status, "Approved");
        assert!(f.bus.wait_for_published(3, WAIT).await);
        tokio::time::sleep(SETTLE).await;

        let changed = f.bus.published(ORDER_STATUS_CHANGED_TOPIC);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[1].message.attributes[CORRELATION_ID_KEY], "approve-1");
        let status = proto::OrderStatus::decode(changed[1].message.data.as_slice()).unwrap();
        assert_eq!(status.status, "Approved");
    }

    #[tokio::test]
    async fn test_empty_status_is_invalid_and_publishes_nothing() {
        let f = fixture();

        for status in ["", "   "] {
            let err = f
                .orchestrator
                .update_order_status(&RequestContext::background(), 1, status)
                .await
                .unwrap_err();
            assert!(matches!(err, OrderError::InvalidStatus(_)));
        }

        assert_eq!(f.repository.update_calls(), 0);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(f.bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found_and_publishes_nothing() {
        let f = fixture();

        let err = f
            .orchestrator
            .update_order_status(&RequestContext::background(), 42, "Approved")
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        tokio::time::sleep(SETTLE).await;
        assert_eq!(f.bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_unrecognised_status_label_is_accepted() {
        let f = fixture();
        let ctx = RequestContext::background();
        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();

        let updated = f
            .orchestrator
            .update_order_status(&ctx, 1, "OutForDelivery")
            .await
            .unwrap();

        assert_eq!(updated.status, "OutForDelivery");
        assert!(updated.lifecycle_status().is_none());
    }

    // ========================================================================
    // Consumption loops
    // ========================================================================

    #[tokio::test]
    async fn test_approval_message_updates_order_and_is_acked() {
        let f = fixture();
        let ctx = RequestContext::background();
        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();
        assert!(f.bus.wait_for_published(2, WAIT).await);

        let (trigger, signal) = shutdown_channel();
        let orchestrator = f.orchestrator.clone();
        let approvals = tokio::spawn(async move { orchestrator.handle_order_approval(signal).await });

        let mut attributes = HashMap::new();
        attributes.insert(CORRELATION_ID_KEY.to_string(), "approval-7".to_string());
        f.bus
            .deliver(APPROVE_ORDER_SUBSCRIPTION, status_message(1, "Approved"), attributes)
            .unwrap();

        assert!(f.bus.wait_for_acknowledgements(1, WAIT).await);
        assert_eq!(f.bus.acknowledgements()[0].outcome, DeliveryOutcome::Acked);
        assert_eq!(f.repository.get(1).await.unwrap().status, "Approved");

        assert!(f.bus.wait_for_published(3, WAIT).await);
        let changed = f.bus.published(ORDER_STATUS_CHANGED_TOPIC);
        assert_eq!(changed[1].message.attributes[CORRELATION_ID_KEY], "approval-7");

        trigger.trigger();
        let stopped = tokio::time::timeout(WAIT, approvals).await.unwrap().unwrap();
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_unparseable_message_is_nacked_without_update() {
        let f = fixture();
        let (trigger, signal) = shutdown_channel();
        let orchestrator = f.orchestrator.clone();
        let approvals = tokio::spawn(async move { orchestrator.handle_order_approval(signal).await });

        f.bus
            .deliver(APPROVE_ORDER_SUBSCRIPTION, vec![0xff, 0xff, 0xff], HashMap::new())
            .unwrap();

        assert!(f.bus.wait_for_acknowledgements(1, WAIT).await);
        assert_eq!(f.bus.acknowledgements()[0].outcome, DeliveryOutcome::Nacked);
        assert_eq!(f.repository.update_calls(), 0);

        trigger.trigger();
        tokio::time::timeout(WAIT, approvals).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejection_for_unknown_order_is_nacked() {
        let f = fixture();
        let (trigger, signal) = shutdown_channel();
        let orchestrator = f.orchestrator.clone();
        let rejections = tokio::spawn(async move { orchestrator.handle_order_rejection(signal).await });

        f.bus
            .deliver(REJECT_ORDER_SUBSCRIPTION, status_message(404, "Rejected"), HashMap::new())
            .unwrap();

        assert!(f.bus.wait_for_acknowledgements(1, WAIT).await);
        let ledger = f.bus.acknowledgements();
        assert_eq!(ledger[0].outcome, DeliveryOutcome::Nacked);
        assert_eq!(ledger[0].subscription, REJECT_ORDER_SUBSCRIPTION);
        assert_eq!(f.repository.update_calls(), 1);

        trigger.trigger();
        tokio::time::timeout(WAIT, rejections).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_every_message_is_settled_exactly_once() {
        let f = fixture();
        let ctx = RequestContext::background();
        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();

        let (trigger, signal) = shutdown_channel();
        let orchestrator = f.orchestrator.clone();
        let rejections = tokio::spawn(async move { orchestrator.handle_order_rejection(signal).await });

        let ok = f
            .bus
            .deliver(REJECT_ORDER_SUBSCRIPTION, status_message(1, "Rejected"), HashMap::new())
            .unwrap();
        let empty = f
            .bus
            .deliver(REJECT_ORDER_SUBSCRIPTION, status_message(1, ""), HashMap::new())
            .unwrap();

        // One ack plus at least the first nack of the empty-status message
        assert!(f.bus.wait_for_acknowledgements(2, WAIT).await);
        trigger.trigger();
        tokio::time::timeout(WAIT, rejections).await.unwrap().unwrap().unwrap();

        let ledger = f.bus.acknowledgements();
        let first_attempts: Vec<_> = ledger.iter().filter(|r| r.delivery_attempt == 1).collect();
        assert_eq!(first_attempts.len(), 2);
        assert!(first_attempts
            .iter()
            .any(|r| r.message_id == ok && r.outcome == DeliveryOutcome::Acked));
        assert!(first_attempts
            .iter()
            .any(|r| r.message_id == empty && r.outcome == DeliveryOutcome::Nacked));
    }

    #[tokio::test]
    async fn test_missing_subscription_ends_loop_with_error() {
        let bus = InMemoryMessageBus::new();
        let config = EventConfig {
            subscription_retry: crate::utils::RetryConfig::none(),
            ..EventConfig::default()
        };
        let orchestrator = OrderLifecycleOrchestrator::new(
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(bus),
            Arc::new(Metrics::new().unwrap()),
            config,
        );
        let (_trigger, signal) = shutdown_channel();

        let err = orchestrator.handle_order_approval(signal).await.unwrap_err();
        assert!(matches!(err, MessagingError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_loop_exits_promptly_on_shutdown_while_idle() {
        let f = fixture();
        let (trigger, signal) = shutdown_channel();
        let orchestrator = f.orchestrator.clone();
        let approvals = tokio::spawn(async move { orchestrator.handle_order_approval(signal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let stopped = tokio::time::timeout(WAIT, approvals).await;
        assert!(stopped.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_message_in_flight_is_settled_before_loop_exits() {
        let f = fixture();
        let ctx = RequestContext::background();
        f.orchestrator.place_order(&ctx, pepsi(10)).await.unwrap();
        f.repository.set_latency(Some(Duration::from_millis(100)));

        let (trigger, signal) = shutdown_channel();
        let orchestrator = f.orchestrator.clone();
        let approvals = tokio::spawn(async move { orchestrator.handle_order_approval(signal).await });

        f.bus
            .deliver(APPROVE_ORDER_SUBSCRIPTION, status_message(1, "Approved"), HashMap::new())
            .unwrap();

        // Shut down once the status update has started but not finished
        let started = tokio::time::timeout(WAIT, async {
            while f.repository.update_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(started.is_ok());
        assert!(f.bus.acknowledgements().is_empty());
        trigger.trigger();

        let stopped = tokio::time::timeout(WAIT, approvals).await;
        assert!(stopped.unwrap().unwrap().is_ok());

        let ledger = f.bus.acknowledgements();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].outcome, DeliveryOutcome::Acked);
        assert_eq!(f.repository.get(1).await.unwrap().status, "Approved");
    }
}
