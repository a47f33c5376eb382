use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use rabbit_shop::config::OrderServiceConfig;
use rabbit_shop::rabbitmq::{ConnectionManager, Consumer, Publisher};
use rabbit_shop::services::orders::{self, OrderHandler, OrderStore};
use rabbit_shop::services::{health, shutdown_signal};
use rabbit_shop::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrderServiceConfig::from_env().context("invalid order service configuration")?;
    init_tracing();

    let manager = ConnectionManager::with_lapin(config.broker.clone());
    let store = OrderStore::new();
    let publisher = Publisher::new(manager.clone());

    manager.declare_queue(config.products_queue.clone()).await?;
    Consumer::new(manager.clone())
        .subscribe(
            config.orders_queue.clone(),
            OrderHandler::new(store.clone(), publisher, config.products_queue.name()),
        )
        .await?;
    manager.start();

    let app = orders::router(store).merge(health::router("Order Service", manager.clone()));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Order service listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}
