use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{NamedService, UnaryService};
use tonic::transport::Server;
use tonic_prost::ProstCodec;

use super::proto;
use super::OrderGrpcHandler;
use crate::context::ShutdownSignal;

// ============================================================================
// gRPC Service
// ============================================================================
//
// Routes the two unary methods of orders.OrderService onto OrderGrpcHandler:
//   /orders.OrderService/Create            → OrderGrpcHandler::create
//   /orders.OrderService/ChangeOrderStatus → OrderGrpcHandler::change_order_status
//
// Unknown paths answer with grpc-status UNIMPLEMENTED.
//
// ============================================================================

pub const SERVICE_NAME: &str = "orders.OrderService";

const CREATE_PATH: &str = "/orders.OrderService/Create";
const CHANGE_ORDER_STATUS_PATH: &str = "/orders.OrderService/ChangeOrderStatus";

#[derive(Clone)]
pub struct OrderServiceServer {
    handler: Arc<OrderGrpcHandler>,
}

impl OrderServiceServer {
    pub fn new(handler: OrderGrpcHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

struct CreateSvc(Arc<OrderGrpcHandler>);

impl UnaryService<proto::Order> for CreateSvc {
    type Response = proto::Order;
    type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<proto::Order>) -> Self::Future {
        let handler = Arc::clone(&self.0);
        Box::pin(async move { handler.create(request).await })
    }
}

struct ChangeOrderStatusSvc(Arc<OrderGrpcHandler>);

impl UnaryService<proto::OrderStatus> for ChangeOrderStatusSvc {
    type Response = ();
    type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<proto::OrderStatus>) -> Self::Future {
        let handler = Arc::clone(&self.0);
        Box::pin(async move { handler.change_order_status(request).await })
    }
}

impl<B> Service<http::Request<B>> for OrderServiceServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let handler = Arc::clone(&self.handler);

        match req.uri().path() {
            CREATE_PATH => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(ProstCodec::<proto::Order, proto::Order>::default());
                Ok(grpc.unary(CreateSvc(handler), req).await)
            }),
            CHANGE_ORDER_STATUS_PATH => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(ProstCodec::<(), proto::OrderStatus>::default());
                Ok(grpc.unary(ChangeOrderStatusSvc(handler), req).await)
            }),
            _ => Box::pin(async move {
                let mut response = http::Response::new(tonic::body::Body::default());
                let headers = response.headers_mut();
                headers.insert(
                    tonic::Status::GRPC_STATUS,
                    (tonic::Code::Unimplemented as i32).into(),
                );
                headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
                Ok(response)
            }),
        }
    }
}

impl NamedService for OrderServiceServer {
    const NAME: &'static str = SERVICE_NAME;
}

/// Serve the order RPCs on `addr` until `shutdown` fires
pub async fn serve_grpc(
    handler: OrderGrpcHandler,
    addr: SocketAddr,
    mut shutdown: ShutdownSignal,
) -> Result<(), tonic::transport::Error> {
    tracing::info!(address = %addr, service = SERVICE_NAME, "🚀 gRPC server listening");

    Server::builder()
        .add_service(OrderServiceServer::new(handler))
        .serve_with_shutdown(addr, async move { shutdown.triggered().await })
        .await?;

    tracing::info!("gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use crate::domain::order::OrderValidator;
    use crate::messaging::InMemoryMessageBus;
    use crate::metrics::Metrics;
    use crate::orchestrator::OrderLifecycleOrchestrator;
    use crate::repository::InMemoryOrderRepository;
    use std::time::Duration;

    fn server() -> OrderServiceServer {
        let orchestrator = OrderLifecycleOrchestrator::new(
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(InMemoryMessageBus::new()),
            Arc::new(Metrics::new().unwrap()),
            EventConfig::default(),
        );
        OrderServiceServer::new(OrderGrpcHandler::new(
            orchestrator,
            OrderValidator::new(true),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let mut server = server();
        let request = http::Request::builder()
            .uri("/orders.OrderService/DeleteOrder")
            .body(tonic::body::Body::empty())
            .unwrap();

        let response = Service::call(&mut server, request).await.unwrap();

        let status = response.headers().get(tonic::Status::GRPC_STATUS).unwrap();
        assert_eq!(status.to_str().unwrap(), (tonic::Code::Unimplemented as i32).to_string());
    }

    #[test]
    fn test_service_name() {
        assert_eq!(<OrderServiceServer as NamedService>::NAME, "orders.OrderService");
        assert!(CREATE_PATH.starts_with(&format!("/{}/", SERVICE_NAME)));
        assert!(CHANGE_ORDER_STATUS_PATH.starts_with(&format!("/{}/", SERVICE_NAME)));
    }
}
