// ============================================================================
// Protobuf messages of the order service
// ============================================================================
//
// Shared by the RPC surface and the event payloads on the bus. Identity
// fields use 0 for "not assigned".
//
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct Order {
    #[prost(int64, tag = "1")]
    pub order_id: i64,
    #[prost(int64, tag = "2")]
    pub customer_id: i64,
    #[prost(int64, tag = "3")]
    pub restaurant_id: i64,
    #[prost(string, tag = "4")]
    pub status: String,
    #[prost(double, tag = "5")]
    pub grand_total: f64,
    #[prost(message, repeated, tag = "6")]
    pub items: Vec<OrderedItem>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderedItem {
    /// Identity of the ordered line, assigned on creation
    #[prost(int64, tag = "1")]
    pub item_id: i64,
    /// Catalog item being ordered
    #[prost(int64, tag = "2")]
    pub ordered_item_id: i64,
    #[prost(int32, tag = "3")]
    pub ordered_quantity: i32,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(double, tag = "5")]
    pub price: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderStatus {
    #[prost(int64, tag = "1")]
    pub order_id: i64,
    #[prost(string, tag = "2")]
    pub status: String,
}
