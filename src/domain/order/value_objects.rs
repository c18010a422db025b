use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Order Value Objects
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderedItem {
    /// Assigned by the repository; must be unset when an order is placed
    pub id: Option<i64>,
    /// External catalog item reference
    pub catalog_item_id: i64,
    pub quantity: i32,
    pub price: f64,
    /// Name or SKU label
    pub name: String,
    /// Owning order (foreign key only)
    pub order_id: Option<i64>,
}

impl OrderedItem {
    pub fn new(catalog_item_id: i64, quantity: i32, price: f64, name: impl Into<String>) -> Self {
        Self {
            id: None,
            catalog_item_id,
            quantity,
            price,
            name: name.into(),
            order_id: None,
        }
    }
}

/// Known lifecycle states.
///
/// Stored orders keep their status as a free-form label (see `Order::status`),
/// so this enum is used for the creation default and for recognising
/// well-known labels, not for rejecting transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Approved,
    Rejected,
    Cancelled,
    Delivered,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::New,
        OrderStatus::Approved,
        OrderStatus::Rejected,
        OrderStatus::Cancelled,
        OrderStatus::Delivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "New",
            OrderStatus::Approved => "Approved",
            OrderStatus::Rejected => "Rejected",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Delivered => "Delivered",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status label '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(label))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
