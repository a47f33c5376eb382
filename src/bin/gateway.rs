use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use rabbit_shop::config::GatewayConfig;
use rabbit_shop::services::{gateway, shutdown_signal};
use rabbit_shop::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    init_tracing();

    for route in &config.routes {
        info!("Routing {} -> {}", route.prefix, route.target);
    }

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("API Gateway listening on {}", config.listen_addr);

    axum::serve(listener, gateway::router(config.routes))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
