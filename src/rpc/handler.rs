use std::time::{Duration, Instant};
use tonic::{Request, Response, Status};

use super::conversions::{from_domain, to_domain};
use super::proto;
use crate::context::{RequestContext, CORRELATION_ID_KEY};
use crate::domain::order::{OrderError, OrderValidator};
use crate::orchestrator::OrderLifecycleOrchestrator;

// ============================================================================
// Order gRPC Handler
// ============================================================================
//
// Transport-facing adapter: builds the RequestContext once per call
// (correlation id from metadata or freshly minted, plus the request
// deadline), validates, converts wire ⇄ domain and maps errors to Status.
//
// ============================================================================

#[derive(Clone)]
pub struct OrderGrpcHandler {
    orchestrator: OrderLifecycleOrchestrator,
    validator: OrderValidator,
    request_timeout: Duration,
}

impl OrderGrpcHandler {
    pub fn new(
        orchestrator: OrderLifecycleOrchestrator,
        validator: OrderValidator,
        request_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            validator,
            request_timeout,
        }
    }

    pub async fn create(&self, request: Request<proto::Order>) -> Result<Response<proto::Order>, Status> {
        let started = Instant::now();
        let ctx = self.context_for(&request);
        let order = to_domain(request.into_inner());

        let result = match self.validator.validate(&order) {
            Ok(()) => self.orchestrator.place_order(&ctx, order).await,
            Err(violations) => Err(OrderError::from(violations)),
        };

        match &result {
            Ok(created) => tracing::info!(
                process = "Create",
                correlation_id = ctx.correlation_id().unwrap_or_default(),
                duration_ms = started.elapsed().as_millis() as u64,
                order_id = created.id.unwrap_or_default(),
                "Request handled"
            ),
            Err(e) => tracing::warn!(
                process = "Create",
                correlation_id = ctx.correlation_id().unwrap_or_default(),
                duration_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Request failed"
            ),
        }

        result
            .map(|created| Response::new(from_domain(&created)))
            .map_err(|e| to_status("failed to place a new order", &e))
    }

    pub async fn change_order_status(
        &self,
        request: Request<proto::OrderStatus>,
    ) -> Result<Response<()>, Status> {
        let started = Instant::now();
        let ctx = self.context_for(&request);
        let change = request.into_inner();

        let result = self
            .orchestrator
            .update_order_status(&ctx, change.order_id, &change.status)
            .await;

        tracing::info!(
            process = "ChangeOrderStatus",
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            duration_ms = started.elapsed().as_millis() as u64,
            order_id = change.order_id,
            ok = result.is_ok(),
            "Request handled"
        );

        result
            .map(|_| Response::new(()))
            .map_err(|e| to_status("error occurred while changing order status", &e))
    }

    fn context_for<T>(&self, request: &Request<T>) -> RequestContext {
        let ctx = match request
            .metadata()
            .get(CORRELATION_ID_KEY)
            .and_then(|value| value.to_str().ok())
        {
            Some(correlation_id) => RequestContext::background().with_correlation_id(correlation_id),
            None => RequestContext::background(),
        };

        ctx.ensure_correlation_id().with_timeout(self.request_timeout)
    }
}

fn to_status(action: &str, err: &OrderError) -> Status {
    match err {
        OrderError::Validation(_) | OrderError::InvalidQuantity { .. } | OrderError::InvalidStatus(_) => {
            Status::invalid_argument(err.to_string())
        }
        e if e.is_not_found() => Status::not_found(err.to_string()),
        OrderError::DeadlineExceeded(_) => Status::deadline_exceeded(format!("{}: {}", action, err)),
        _ => Status::internal(format!("{}: {}", action, err)),
    }
}
