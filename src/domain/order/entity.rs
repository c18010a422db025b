use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value_objects::{OrderStatus, OrderedItem};

// ============================================================================
// Order Entity
// ============================================================================
//
// Identity is assigned by the repository on creation and never changes.
// After creation only `status` is ever mutated (UpdateOrderStatus).
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Order {
    pub id: Option<i64>,
    pub customer_id: i64,
    pub restaurant_id: i64,
    pub grand_total: f64,
    pub items: Vec<OrderedItem>,
    /// Free-form lifecycle label; see `lifecycle_status`
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Order {
    /// A not-yet-persisted order in the creation status
    pub fn new(customer_id: i64, restaurant_id: i64, grand_total: f64, items: Vec<OrderedItem>) -> Self {
        Self {
            id: None,
            customer_id,
            restaurant_id,
            grand_total,
            items,
            status: OrderStatus::New.to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Known lifecycle status, if the stored label is one of them
    pub fn lifecycle_status(&self) -> Option<OrderStatus> {
        self.status.parse().ok()
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}
