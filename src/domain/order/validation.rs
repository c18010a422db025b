use super::entity::Order;
use super::errors::ValidationError;

// ============================================================================
// Order Validator - checks a placement request before it reaches the
// orchestrator. Every rule is evaluated so one call reports all violations.
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct OrderValidator {
    /// Whether the restaurant reference is mandatory
    pub require_restaurant: bool,
}

impl Default for OrderValidator {
    fn default() -> Self {
        Self {
            require_restaurant: true,
        }
    }
}

impl OrderValidator {
    pub fn new(require_restaurant: bool) -> Self {
        Self { require_restaurant }
    }

    pub fn validate(&self, order: &Order) -> Result<(), ValidationError> {
        let mut violations = Vec::new();

        if let Some(id) = order.id {
            violations.push(format!(
                "order id should not be supplied on order placement, provided {} expected 0",
                id
            ));
        }

        if order.items.is_empty() {
            violations.push("cannot place an order with empty items".to_string());
        }

        for (position, item) in order.items.iter().enumerate() {
            // Unnamed items are referenced by position
            let label = if item.name.is_empty() {
                format!("#{}", position + 1)
            } else {
                item.name.clone()
            };

            if item.catalog_item_id <= 0 {
                violations.push(format!(
                    "ordered item id for item {} should be valid, given {}",
                    label, item.catalog_item_id
                ));
            }
            if let Some(id) = item.id {
                violations.push(format!(
                    "item id for item {} should not be initialized, given {}",
                    label, id
                ));
            }
            if item.name.is_empty() {
                violations.push(format!("the name field is required for item {}", label));
            }
            if item.quantity <= 0 {
                violations.push(format!(
                    "the quantity for item with sku {} should be greater than zero, given {}",
                    label, item.quantity
                ));
            }
        }

        if order.customer_id <= 0 {
            violations.push("the customer id must be supplied".to_string());
        }
        if self.require_restaurant && order.restaurant_id <= 0 {
            violations.push("the restaurant id must be supplied".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(violations))
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
