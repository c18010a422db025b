use super::proto;
use crate::domain::order::{Order, OrderedItem, StatusChange};

fn identity(id: i64) -> Option<i64> {
    (id != 0).then_some(id)
}

/// Wire order to domain order. Identities of 0 become unset.
pub fn to_domain(order: proto::Order) -> Order {
    Order {
        id: identity(order.order_id),
        customer_id: order.customer_id,
        restaurant_id: order.restaurant_id,
        grand_total: order.grand_total,
        status: order.status,
        items: order.items.into_iter().map(item_to_domain).collect(),
        created_at: None,
        updated_at: None,
    }
}

fn item_to_domain(item: proto::OrderedItem) -> OrderedItem {
    OrderedItem {
        id: identity(item.item_id),
        catalog_item_id: item.ordered_item_id,
        quantity: item.ordered_quantity,
        price: item.price,
        name: item.name,
        order_id: None,
    }
}

pub fn from_domain(order: &Order) -> proto::Order {
    proto::Order {
        order_id: order.id.unwrap_or_default(),
        customer_id: order.customer_id,
        restaurant_id: order.restaurant_id,
        status: order.status.clone(),
        grand_total: order.grand_total,
        items: order
            .items
            .iter()
            .map(|item| proto::OrderedItem {
                item_id: item.id.unwrap_or_default(),
                ordered_item_id: item.catalog_item_id,
                ordered_quantity: item.quantity,
                name: item.name.clone(),
                price: item.price,
            })
            .collect(),
    }
}

impl From<StatusChange> for proto::OrderStatus {
    fn from(change: StatusChange) -> Self {
        Self {
            order_id: change.order_id,
            status: change.status,
        }
    }
}

impl From<proto::OrderStatus> for StatusChange {
    fn from(status: proto::OrderStatus) -> Self {
        StatusChange::new(status.order_id, status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_order() -> proto::Order {
        proto::Order {
            order_id: 0,
            customer_id: 1,
            restaurant_id: 2,
            status: String::new(),
            grand_total: 10.0,
            items: vec![proto::OrderedItem {
                item_id: 0,
                ordered_item_id: 1,
                ordered_quantity: 10,
                name: "Pepsi".to_string(),
                price: 1.0,
            }],
        }
    }

    #[test]
    fn test_zero_identities_become_unset() {
        let order = to_domain(wire_order());

        assert_eq!(order.id, None);
        assert_eq!(order.items[0].id, None);
        assert_eq!(order.items[0].catalog_item_id, 1);
        assert_eq!(order.items[0].quantity, 10);
        assert_eq!(order.restaurant_id, 2);
    }

    #[test]
    fn test_supplied_identities_are_kept_for_validation() {
        let mut wire = wire_order();
        wire.order_id = 9;
        wire.items[0].item_id = 4;

        let order = to_domain(wire);
        assert_eq!(order.id, Some(9));
        assert_eq!(order.items[0].id, Some(4));
    }

    #[test]
    fn test_persisted_order_to_wire() {
        let mut order = to_domain(wire_order());
        order.id = Some(7);
        order.status = "New".to_string();
        order.items[0].id = Some(3);

        let wire = from_domain(&order);
        assert_eq!(wire.order_id, 7);
        assert_eq!(wire.status, "New");
        assert_eq!(wire.items[0].item_id, 3);
        assert_eq!(wire.items[0].ordered_item_id, 1);
    }
}
