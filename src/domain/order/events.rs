use serde::{Deserialize, Serialize};

use super::entity::Order;

// ============================================================================
// Order Lifecycle Events - names and projections exchanged on the bus
// ============================================================================

/// Topic receiving the full order projection after placement
pub const ORDER_CREATED_TOPIC: &str = "orderCreated";
/// Topic receiving `{order id, status}` after every status change
pub const ORDER_STATUS_CHANGED_TOPIC: &str = "orderStatusChanged";

/// Inbound approval instructions
pub const APPROVE_ORDER_SUBSCRIPTION: &str = "approveOrder";
/// Inbound rejection instructions
pub const REJECT_ORDER_SUBSCRIPTION: &str = "rejectOrder";

pub const SERVICE_ATTRIBUTE: &str = "service";
pub const HOST_ATTRIBUTE: &str = "host";

/// Minimal status projection, used both for outbound `orderStatusChanged`
/// events and inbound approve/reject instructions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub order_id: i64,
    pub status: String,
}

impl StatusChange {
    pub fn new(order_id: i64, status: impl Into<String>) -> Self {
        Self {
            order_id,
            status: status.into(),
        }
    }
}

impl From<&Order> for StatusChange {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id.unwrap_or_default(),
            status: order.status.clone(),
        }
    }
}
