use anyhow::Context;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::order::{APPROVE_ORDER_SUBSCRIPTION, REJECT_ORDER_SUBSCRIPTION};
use crate::utils::RetryConfig;

// ============================================================================
// Configuration
// ============================================================================
//
// Everything is read from the environment with defaults for local runs:
//
//   DATABASE_URL                          Postgres URL (unset: in-memory store)
//   ORDERS_DB_MAX_CONNECTIONS             pool size
//   ORDERS_BROKERS                        Kafka bootstrap list (unset: in-memory bus)
//   ORDERS_METRICS_PORT                   /metrics and /health port
//   ORDERS_GRPC_PORT                      orders.OrderService port
//   ORDERS_MAX_DELIVERY_ATTEMPTS          deliveries before a message is dead-lettered
//   ORDERS_REQUEST_TIMEOUT_MS             deadline applied to RPC requests
//   ORDERS_REQUIRE_RESTAURANT             whether placement needs a restaurant id
//   ORDERS_SERVICE_NAME                   "service" attribute on published events
//   HOSTNAME                              "host" attribute on published events
//   ORDERS_PUBLISH_TIMEOUT_MS             per-publish timeout
//   ORDERS_HANDLER_TIMEOUT_MS             per-message handler timeout
//   ORDERS_RECEIVE_RETRY_DELAY_MS         pause after a failed receive
//   ORDERS_APPROVAL_SUBSCRIPTION          approval subscription name
//   ORDERS_REJECTION_SUBSCRIPTION         rejection subscription name
//   ORDERS_SUBSCRIPTION_TOPICS            "sub=topic,sub=topic" bindings
//   ORDERS_SUBSCRIPTION_RETRY_ATTEMPTS    attempts to acquire a subscription
//   ORDERS_FAIL_FAST_ON_SUBSCRIPTION_ERROR  stop the service if a subscription is missing
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventConfig {
    pub service_name: String,
    pub host: String,
    pub publish_timeout: Duration,
    pub handler_timeout: Duration,
    pub receive_retry_delay: Duration,
    pub approval_subscription: String,
    pub rejection_subscription: String,
    /// Subscription name to topic; unbound subscriptions use their own name
    pub subscription_topics: HashMap<String, String>,
    pub subscription_retry: RetryConfig,
    pub fail_fast_on_subscription_error: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            service_name: "orders-service".to_string(),
            host: "localhost".to_string(),
            publish_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(30),
            receive_retry_delay: Duration::from_secs(1),
            approval_subscription: APPROVE_ORDER_SUBSCRIPTION.to_string(),
            rejection_subscription: REJECT_ORDER_SUBSCRIPTION.to_string(),
            subscription_topics: HashMap::new(),
            subscription_retry: RetryConfig::aggressive(),
            fail_fast_on_subscription_error: false,
        }
    }
}

impl EventConfig {
    pub fn topic_for_subscription<'a>(&'a self, subscription: &'a str) -> &'a str {
        self.subscription_topics
            .get(subscription)
            .map(String::as_str)
            .unwrap_or(subscription)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let subscription_topics = match lookup("ORDERS_SUBSCRIPTION_TOPICS") {
            Some(raw) => parse_bindings(&raw)?,
            None => defaults.subscription_topics,
        };

        let subscription_retry = match parse::<u32>(lookup, "ORDERS_SUBSCRIPTION_RETRY_ATTEMPTS")? {
            Some(max_attempts) => RetryConfig {
                max_attempts,
                ..defaults.subscription_retry
            },
            None => defaults.subscription_retry,
        };

        Ok(Self {
            service_name: lookup("ORDERS_SERVICE_NAME").unwrap_or(defaults.service_name),
            host: lookup("HOSTNAME").unwrap_or(defaults.host),
            publish_timeout: millis(lookup, "ORDERS_PUBLISH_TIMEOUT_MS")?
                .unwrap_or(defaults.publish_timeout),
            handler_timeout: millis(lookup, "ORDERS_HANDLER_TIMEOUT_MS")?
                .unwrap_or(defaults.handler_timeout),
            receive_retry_delay: millis(lookup, "ORDERS_RECEIVE_RETRY_DELAY_MS")?
                .unwrap_or(defaults.receive_retry_delay),
            approval_subscription: lookup("ORDERS_APPROVAL_SUBSCRIPTION")
                .unwrap_or(defaults.approval_subscription),
            rejection_subscription: lookup("ORDERS_REJECTION_SUBSCRIPTION")
                .unwrap_or(defaults.rejection_subscription),
            subscription_topics,
            subscription_retry,
            fail_fast_on_subscription_error: parse(lookup, "ORDERS_FAIL_FAST_ON_SUBSCRIPTION_ERROR")?
                .unwrap_or(defaults.fail_fast_on_subscription_error),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub brokers: Option<String>,
    pub metrics_port: u16,
    pub grpc_port: u16,
    pub max_delivery_attempts: u32,
    pub request_timeout: Duration,
    pub require_restaurant: bool,
    pub events: EventConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            brokers: None,
            metrics_port: 9090,
            grpc_port: 9000,
            max_delivery_attempts: 5,
            request_timeout: Duration::from_secs(15),
            require_restaurant: true,
            events: EventConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            database_max_connections: parse(lookup, "ORDERS_DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            brokers: lookup("ORDERS_BROKERS"),
            metrics_port: parse(lookup, "ORDERS_METRICS_PORT")?.unwrap_or(defaults.metrics_port),
            grpc_port: parse(lookup, "ORDERS_GRPC_PORT")?.unwrap_or(defaults.grpc_port),
            max_delivery_attempts: parse(lookup, "ORDERS_MAX_DELIVERY_ATTEMPTS")?
                .unwrap_or(defaults.max_delivery_attempts),
            request_timeout: millis(lookup, "ORDERS_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
            require_restaurant: parse(lookup, "ORDERS_REQUIRE_RESTAURANT")?
                .unwrap_or(defaults.require_restaurant),
            events: EventConfig::from_lookup(lookup)?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}

fn parse_bindings(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (subscription, topic) = pair
                .split_once('=')
                .with_context(|| format!("Invalid subscription binding {:?}, expected sub=topic", pair))?;
            Ok((subscription.trim().to_string(), topic.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = ServiceConfig::from_lookup(&lookup_from(&[])).unwrap();

        assert!(config.database_url.is_none());
        assert!(config.brokers.is_none());
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.grpc_port, 9000);
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert!(config.require_restaurant);
        assert_eq!(config.events.approval_subscription, "approveOrder");
        assert_eq!(config.events.rejection_subscription, "rejectOrder");
        assert!(!config.events.fail_fast_on_subscription_error);
    }

    #[test]
    fn test_values_from_environment() {
        let config = ServiceConfig::from_lookup(&lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("ORDERS_BROKERS", "127.0.0.1:9092"),
            ("ORDERS_PUBLISH_TIMEOUT_MS", "250"),
            ("HOSTNAME", "orders-7f9"),
            ("ORDERS_SUBSCRIPTION_RETRY_ATTEMPTS", "2"),
            ("ORDERS_FAIL_FAST_ON_SUBSCRIPTION_ERROR", "true"),
            ("ORDERS_GRPC_PORT", "50051"),
            ("ORDERS_REQUEST_TIMEOUT_MS", "500"),
            ("ORDERS_REQUIRE_RESTAURANT", "false"),
            ("ORDERS_MAX_DELIVERY_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/orders"));
        assert_eq!(config.brokers.as_deref(), Some("127.0.0.1:9092"));
        assert_eq!(config.events.publish_timeout, Duration::from_millis(250));
        assert_eq!(config.events.host, "orders-7f9");
        assert_eq!(config.events.subscription_retry.max_attempts, 2);
        assert!(config.events.fail_fast_on_subscription_error);
        assert_eq!(config.grpc_port, 50051);
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert!(!config.require_restaurant);
        assert_eq!(config.max_delivery_attempts, 3);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = ServiceConfig::from_lookup(&lookup_from(&[("ORDERS_METRICS_PORT", "ninety")]))
            .unwrap_err();
        assert!(err.to_string().contains("ORDERS_METRICS_PORT"));
    }

    #[test]
    fn test_subscription_bindings() {
        let config = ServiceConfig::from_lookup(&lookup_from(&[(
            "ORDERS_SUBSCRIPTION_TOPICS",
            "approveOrder=orderApproved, rejectOrder=orderRejected",
        )]))
        .unwrap();

        assert_eq!(config.events.topic_for_subscription("approveOrder"), "orderApproved");
        assert_eq!(config.events.topic_for_subscription("rejectOrder"), "orderRejected");
        assert_eq!(config.events.topic_for_subscription("other"), "other");
    }

    #[test]
    fn test_malformed_binding_is_rejected() {
        assert!(parse_bindings("approveOrder").is_err());
    }
}
