use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use rabbit_shop::config::ProductServiceConfig;
use rabbit_shop::rabbitmq::{ConnectionManager, Consumer, Publisher};
use rabbit_shop::services::products::{self, CompletionHandler, OrderTracker};
use rabbit_shop::services::{health, shutdown_signal};
use rabbit_shop::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config =
        ProductServiceConfig::from_env().context("invalid product service configuration")?;
    init_tracing();

    let manager = ConnectionManager::with_lapin(config.broker.clone());
    let tracker = OrderTracker::new();

    manager.declare_queue(config.orders_queue.clone()).await?;
    Consumer::new(manager.clone())
        .subscribe(
            config.products_queue.clone(),
            CompletionHandler::new(tracker.clone()),
        )
        .await?;
    manager.start();

    let app = products::router(
        tracker,
        Publisher::new(manager.clone()),
        config.orders_queue.name(),
    )
    .merge(health::router("Product Service", manager.clone()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Product service listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}
