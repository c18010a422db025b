// ============================================================================
// Order Repository - persistence contract
// ============================================================================
//
// The orchestrator only depends on the OrderRepository trait. Two adapters:
// - postgres: sqlx-backed production storage
// - memory:   concurrency-safe map for local runs and tests
//
// Implementations must be safe for concurrent use; serializing concurrent
// status updates for the same order is their responsibility.
//
// ============================================================================

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::domain::order::Order;

pub use memory::InMemoryOrderRepository;
pub use postgres::PostgresOrderRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("order with id {0} not found")]
    NotFound(i64),

    #[error("order conflicts with an existing record: {0}")]
    Conflict(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist a new order and its items, returning it with identities assigned
    async fn create(&self, ctx: &RequestContext, order: Order) -> Result<Order, RepositoryError>;

    /// Replace the status label of an existing order
    async fn update_order_status(
        &self,
        ctx: &RequestContext,
        id: i64,
        status: &str,
    ) -> Result<Order, RepositoryError>;
}
