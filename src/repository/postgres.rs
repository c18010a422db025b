use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{OrderRepository, RepositoryError};
use crate::context::RequestContext;
use crate::domain::order::{Order, OrderedItem};

// ============================================================================
// Postgres Order Repository (sqlx)
// ============================================================================
//
// Tables:
//   orders        - one row per order, status stored as a free-form label
//   ordered_items - owned by orders via order_id (ON DELETE CASCADE)
//
// Creation writes the order and its items in a single transaction so an
// order is never visible without its items. A status update and the item
// read that completes the returned order share one transaction too.
//
// ============================================================================

const CREATE_ORDERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS orders (
    id BIGSERIAL PRIMARY KEY,
    customer_id BIGINT NOT NULL,
    restaurant_id BIGINT NOT NULL,
    status TEXT NOT NULL,
    grand_total DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_ORDERED_ITEMS_TABLE: &str = "CREATE TABLE IF NOT EXISTS ordered_items (
    id BIGSERIAL PRIMARY KEY,
    order_id BIGINT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    catalog_item_id BIGINT NOT NULL,
    quantity INTEGER NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    name TEXT NOT NULL
)";

const CREATE_ORDERED_ITEMS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS ordered_items_order_id_idx ON ordered_items (order_id)";

#[derive(Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in [
            CREATE_ORDERS_TABLE,
            CREATE_ORDERED_ITEMS_TABLE,
            CREATE_ORDERED_ITEMS_INDEX,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to apply schema statement: {}", statement))?;
        }

        tracing::info!("✅ Orders schema is ready");
        Ok(())
    }

}

async fn load_items(conn: &mut PgConnection, order_id: i64) -> Result<Vec<OrderedItem>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT id, order_id, catalog_item_id, quantity, price, name
         FROM ordered_items
         WHERE order_id = $1
         ORDER BY id ASC",
    )
    .bind(order_id)
    .fetch_all(conn)
    .await
    .map_err(map_sqlx_error)?;

    rows.iter().map(item_from_row).collect()
}

fn map_sqlx_error(error: sqlx::Error) -> RepositoryError {
    match &error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            RepositoryError::Conflict(db_error.message().to_string())
        }
        _ => RepositoryError::Unknown(anyhow::Error::new(error)),
    }
}

fn item_from_row(row: &PgRow) -> Result<OrderedItem, RepositoryError> {
    Ok(OrderedItem {
        id: Some(row.try_get("id").map_err(map_sqlx_error)?),
        order_id: Some(row.try_get("order_id").map_err(map_sqlx_error)?),
        catalog_item_id: row.try_get("catalog_item_id").map_err(map_sqlx_error)?,
        quantity: row.try_get("quantity").map_err(map_sqlx_error)?,
        price: row.try_get("price").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
    })
}

fn order_from_row(row: &PgRow, items: Vec<OrderedItem>) -> Result<Order, RepositoryError> {
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(map_sqlx_error)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(map_sqlx_error)?;

    Ok(Order {
        id: Some(row.try_get("id").map_err(map_sqlx_error)?),
        customer_id: row.try_get("customer_id").map_err(map_sqlx_error)?,
        restaurant_id: row.try_get("restaurant_id").map_err(map_sqlx_error)?,
        grand_total: row.try_get("grand_total").map_err(map_sqlx_error)?,
        status: row.try_get("status").map_err(map_sqlx_error)?,
        items,
        created_at: Some(created_at),
        updated_at: Some(updated_at),
    })
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn create(&self, ctx: &RequestContext, order: Order) -> Result<Order, RepositoryError> {
        if let Some(id) = order.id {
            return Err(RepositoryError::Conflict(format!("order id {} already assigned", id)));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let order_row = sqlx::query(
            "INSERT INTO orders (customer_id, restaurant_id, status, grand_total)
             VALUES ($1, $2, $3, $4)
             RETURNING id, customer_id, restaurant_id, status, grand_total, created_at, updated_at",
        )
        .bind(order.customer_id)
        .bind(order.restaurant_id)
        .bind(&order.status)
        .bind(order.grand_total)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let order_id: i64 = order_row.try_get("id").map_err(map_sqlx_error)?;

        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let item_row = sqlx::query(
                "INSERT INTO ordered_items (order_id, catalog_item_id, quantity, price, name)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id, order_id, catalog_item_id, quantity, price, name",
            )
            .bind(order_id)
            .bind(item.catalog_item_id)
            .bind(item.quantity)
            .bind(item.price)
            .bind(&item.name)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            items.push(item_from_row(&item_row)?);
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::info!(
            order_id = order_id,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            item_count = items.len(),
            "✅ Persisted order"
        );

        order_from_row(&order_row, items)
    }

    async fn update_order_status(
        &self,
        ctx: &RequestContext,
        id: i64,
        status: &str,
    ) -> Result<Order, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Row lock held until commit serializes concurrent updates
        let row = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = now()
             WHERE id = $2
             RETURNING id, customer_id, restaurant_id, status, grand_total, created_at, updated_at",
        )
        .bind(status)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or(RepositoryError::NotFound(id))?;

        let items = load_items(&mut tx, id).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::info!(
            order_id = id,
            status = %status,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            "Updated order status"
        );

        order_from_row(&row, items)
    }
}
