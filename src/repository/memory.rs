use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{OrderRepository, RepositoryError};
use crate::context::RequestContext;
use crate::domain::order::Order;

// ============================================================================
// In-Memory Order Repository
// ============================================================================
//
// Used when no DATABASE_URL is configured, and as the repository fake in
// tests. Status updates for one order are serialized by the write lock.
//
// ============================================================================

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<BTreeMap<i64, Order>>,
    next_order_id: AtomicI64,
    next_item_id: AtomicI64,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    injected_failure: Mutex<Option<String>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub async fn get(&self, id: i64) -> Option<Order> {
        self.orders.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }

    /// Every following call fails with an unknown error until cleared
    pub fn inject_failure(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.injected_failure.lock() {
            *failure = message.map(str::to_string);
        }
    }

    /// Artificial delay before every call, to exercise deadlines
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    async fn simulate_conditions(&self) -> Result<(), RepositoryError> {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.injected_failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(message) => Err(RepositoryError::Unknown(anyhow::anyhow!(message))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create(&self, ctx: &RequestContext, mut order: Order) -> Result<Order, RepositoryError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_conditions().await?;

        if let Some(id) = order.id {
            return Err(RepositoryError::Conflict(format!("order id {} already assigned", id)));
        }

        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();

        order.id = Some(id);
        order.created_at = Some(now);
        order.updated_at = Some(now);
        for item in &mut order.items {
            item.id = Some(self.next_item_id.fetch_add(1, Ordering::SeqCst) + 1);
            item.order_id = Some(id);
        }

        self.orders.write().await.insert(id, order.clone());

        tracing::debug!(
            order_id = id,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            item_count = order.items.len(),
            "Stored order in memory"
        );

        Ok(order)
    }

    async fn update_order_status(
        &self,
        ctx: &RequestContext,
        id: i64,
        status: &str,
    ) -> Result<Order, RepositoryError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_conditions().await?;

        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        order.status = status.to_string();
        order.updated_at = Some(Utc::now());

        tracing::debug!(
            order_id = id,
            status = %status,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            "Updated order status in memory"
        );

        Ok(order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderedItem;

    fn sample_order() -> Order {
        Order::new(1, 1, 10.0, vec![OrderedItem::new(1, 10, 1.0, "Pepsi")])
    }

    #[tokio::test]
    async fn test_create_assigns_identities() {
        let repo = InMemoryOrderRepository::new();
        let ctx = RequestContext::background();

        let first = repo.create(&ctx, sample_order()).await.unwrap();
        let second = repo.create(&ctx, sample_order()).await.unwrap();

        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
        assert_eq!(first.items[0].order_id, Some(1));
        assert!(first.items[0].id.is_some());
        assert!(first.created_at.is_some());
        assert_eq!(repo.create_calls(), 2);
        assert_eq!(repo.len().await, 2);
    }

    #[tokio::test]
    async fn test_create_with_identity_conflicts() {
        let repo = InMemoryOrderRepository::new();
        let mut order = sample_order();
        order.id = Some(10);

        let err = repo.create(&RequestContext::background(), order).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_status_changes_only_status() {
        let repo = InMemoryOrderRepository::new();
        let ctx = RequestContext::background();
        let created = repo.create(&ctx, sample_order()).await.unwrap();

        let updated = repo.update_order_status(&ctx, 1, "Approved").await.unwrap();

        assert_eq!(updated.status, "Approved");
        assert_eq!(updated.items, created.items);
        assert_eq!(updated.grand_total, created.grand_total);
        assert_eq!(updated.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_update_unknown_order_is_not_found() {
        let repo = InMemoryOrderRepository::new();
        let err = repo
            .update_order_status(&RequestContext::background(), 99, "Approved")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(99)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let repo = InMemoryOrderRepository::new();
        repo.inject_failure(Some("connection reset"));

        let err = repo.create(&RequestContext::background(), sample_order()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unknown(_)));
        assert_eq!(err.to_string(), "connection reset");

        repo.inject_failure(None);
        assert!(repo.create(&RequestContext::background(), sample_order()).await.is_ok());
    }
}
