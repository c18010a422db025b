use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orders_service::config::ServiceConfig;
use orders_service::context::shutdown_channel;
use orders_service::domain::order::OrderValidator;
use orders_service::messaging::{InMemoryMessageBus, MessageBus, RedpandaConfig, RedpandaMessageBus};
use orders_service::metrics::{self, Metrics};
use orders_service::orchestrator::{LifecycleSupervisor, OrderLifecycleOrchestrator};
use orders_service::repository::{InMemoryOrderRepository, OrderRepository, PostgresOrderRepository};
use orders_service::rpc::{serve_grpc, OrderGrpcHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO, crate at DEBUG; override with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,orders_service=debug")),
        )
        .init();

    tracing::info!("🚀 Starting orders service");

    let config = ServiceConfig::from_env()?;

    // === 1. Repository ===
    let repository: Arc<dyn OrderRepository> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to Postgres...");
            let repository = PostgresOrderRepository::connect(url, config.database_max_connections).await?;
            repository.ensure_schema().await?;
            Arc::new(repository)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, orders are kept in memory");
            Arc::new(InMemoryOrderRepository::new())
        }
    };

    // === 2. Message bus ===
    let bus: Arc<dyn MessageBus> = match &config.brokers {
        Some(brokers) => {
            let redpanda = RedpandaConfig::new(brokers.as_str())
                .with_subscription_topics(config.events.subscription_topics.clone())
                .with_max_delivery_attempts(config.max_delivery_attempts);
            Arc::new(RedpandaMessageBus::new(redpanda)?)
        }
        None => {
            tracing::warn!("ORDERS_BROKERS not set, using the in-process message bus");
            let events = &config.events;
            let bus = InMemoryMessageBus::with_max_delivery_attempts(config.max_delivery_attempts);
            bus.add_order_topology(
                &events.approval_subscription,
                events.topic_for_subscription(&events.approval_subscription),
                &events.rejection_subscription,
                events.topic_for_subscription(&events.rejection_subscription),
            );
            Arc::new(bus)
        }
    };

    // === 3. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // actix-web runs on its own system thread
    let metrics_registry = Arc::new(metrics.registry().clone());
    let service_name = config.events.service_name.clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let served = actix_web::rt::System::new().block_on(metrics::start_metrics_server(
            metrics_registry,
            service_name,
            metrics_port,
        ));
        if let Err(e) = served {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 4. gRPC server ===
    let orchestrator = OrderLifecycleOrchestrator::new(repository, bus, metrics, config.events.clone());
    let handler = OrderGrpcHandler::new(
        orchestrator.clone(),
        OrderValidator::new(config.require_restaurant),
        config.request_timeout,
    );
    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
    let (grpc_trigger, grpc_signal) = shutdown_channel();
    let grpc = tokio::spawn(async move {
        if let Err(e) = serve_grpc(handler, grpc_addr, grpc_signal).await {
            tracing::error!(error = %e, address = %grpc_addr, "gRPC server error");
        }
    });

    // === 5. Lifecycle loops ===
    let supervisor = LifecycleSupervisor::start(orchestrator);

    supervisor
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    grpc_trigger.trigger();
    if let Err(e) = grpc.await {
        tracing::error!(error = %e, "gRPC server task failed");
    }

    tracing::info!("👋 Orders service stopped");
    Ok(())
}
