// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the order lifecycle
// ============================================================================
//
// - Order placement (successes, failures by reason)
// - Status updates by outcome
// - Event publishing (by topic and outcome, latency)
// - Consumed lifecycle messages (by subscription and outcome)
//
// Everything is registered on one Registry and scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Order Metrics
    pub orders_placed: IntCounter,
    pub order_placement_failures: IntCounterVec,
    pub status_updates: IntCounterVec,

    // Publishing Metrics
    pub events_published: IntCounterVec,
    pub publish_duration: HistogramVec,

    // Consumer Metrics
    pub messages_consumed: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Order Metrics
        let orders_placed = IntCounter::new("orders_placed_total", "Total orders placed")?;
        registry.register(Box::new(orders_placed.clone()))?;

        let order_placement_failures = IntCounterVec::new(
            Opts::new("order_placement_failures_total", "Order placements that failed"),
            &["reason"],
        )?;
        registry.register(Box::new(order_placement_failures.clone()))?;

        let status_updates = IntCounterVec::new(
            Opts::new("order_status_updates_total", "Order status updates by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(status_updates.clone()))?;

        // Publishing Metrics
        let events_published = IntCounterVec::new(
            Opts::new("order_events_published_total", "Lifecycle events published"),
            &["topic", "outcome"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new("order_event_publish_duration_seconds", "Lifecycle event publish duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["topic"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        // Consumer Metrics
        let messages_consumed = IntCounterVec::new(
            Opts::new("order_messages_consumed_total", "Lifecycle messages consumed"),
            &["subscription", "outcome"],
        )?;
        registry.register(Box::new(messages_consumed.clone()))?;

        Ok(Self {
            registry,
            orders_placed,
            order_placement_failures,
            status_updates,
            events_published,
            publish_duration,
            messages_consumed,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_order_placed(&self) {
        self.orders_placed.inc();
    }

    pub fn record_placement_failure(&self, reason: &str) {
        self.order_placement_failures.with_label_values(&[reason]).inc();
    }

    pub fn record_status_update(&self, outcome: &str) {
        self.status_updates.with_label_values(&[outcome]).inc();
    }

    pub fn record_publish(&self, topic: &str, duration_secs: f64, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.events_published.with_label_values(&[topic, outcome]).inc();
        self.publish_duration.with_label_values(&[topic]).observe(duration_secs);
    }

    /// Outcome is "acked" or "nacked"
    pub fn record_consumed(&self, subscription: &str, outcome: &str) {
        self.messages_consumed.with_label_values(&[subscription, outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> f64 {
        metrics
            .registry()
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.metric.iter().map(|s| s.counter.value.unwrap_or(0.0)).sum())
            .unwrap_or(0.0)
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_order_placed();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_orders() {
        let metrics = Metrics::new().unwrap();
        metrics.record_order_placed();
        metrics.record_order_placed();
        metrics.record_placement_failure("invalid_quantity");

        assert_eq!(counter_value(&metrics, "orders_placed_total"), 2.0);
        assert_eq!(counter_value(&metrics, "order_placement_failures_total"), 1.0);
    }

    #[test]
    fn test_record_publish_by_topic() {
        let metrics = Metrics::new().unwrap();
        metrics.record_publish("orderCreated", 0.01, true);
        metrics.record_publish("orderStatusChanged", 0.02, false);

        let gathered = metrics.registry().gather();
        let published = gathered
            .iter()
            .find(|m| m.name() == "order_events_published_total")
            .unwrap();
        assert_eq!(published.metric.len(), 2); // one series per topic
    }

    #[test]
    fn test_record_consumed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_consumed("approveOrder", "acked");
        metrics.record_consumed("approveOrder", "nacked");
        metrics.record_consumed("rejectOrder", "acked");

        assert_eq!(counter_value(&metrics, "order_messages_consumed_total"), 3.0);
    }
}
