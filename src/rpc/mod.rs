// ============================================================================
// RPC adaptation layer
// ============================================================================
//
// - proto:       protobuf messages (also the event payload encoding)
// - conversions: wire ⇄ domain
// - handler:     OrderGrpcHandler (Create, ChangeOrderStatus)
// - server:      tonic service routing orders.OrderService onto the handler
//
// ============================================================================

pub mod proto;
mod conversions;
mod handler;
mod server;

pub use conversions::{from_domain, to_domain};
pub use handler::OrderGrpcHandler;
pub use server::{serve_grpc, OrderServiceServer, SERVICE_NAME};
