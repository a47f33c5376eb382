//! Health endpoint shared by the broker-backed services.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use crate::rabbitmq::ConnectionManager;

#[derive(Clone)]
struct HealthState {
    service: &'static str,
    manager: ConnectionManager,
}

/// Always returns 200. The `rabbitmq` field tells whether the broker link is
/// currently up, so the service stays reachable while it reconnects.
async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    let status = state.manager.status();

    Json(json!({
        "status": "OK",
        "service": state.service,
        "timestamp": Utc::now().to_rfc3339(),
        "rabbitmq": {
            "state": status.state.as_str(),
            "generation": status.generation,
            "connect_attempts": status.connect_attempts,
            "consecutive_failures": status.consecutive_failures,
            "last_error": status.last_error,
        },
    }))
}

pub fn router(service: &'static str, manager: ConnectionManager) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(HealthState { service, manager })
}
