//! Product service: turns buy requests into orders and follows them until the
//! order service reports completion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::message::{OrderCompleted, OrderRequest, OrderStatus};
use crate::rabbitmq::{BrokerError, MessageHandler, Publisher};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TrackedOrder {
    pub id: String,
    pub products: Vec<String>,
    pub qty: u32,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

/// Orders placed through this service, by id.
#[derive(Clone, Default)]
pub struct OrderTracker {
    orders: Arc<RwLock<HashMap<String, TrackedOrder>>>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, request: &OrderRequest) {
        let order = TrackedOrder {
            id: request.id.clone(),
            products: request.products.clone(),
            qty: request.qty,
            status: OrderStatus::Pending,
            updated_at: Utc::now(),
        };
        self.orders.write().await.insert(order.id.clone(), order);
    }

    pub async fn forget(&self, id: &str) {
        self.orders.write().await.remove(id);
    }

    /// Marks an order completed, returning `false` if it was never tracked here.
    pub async fn complete(&self, completion: &OrderCompleted) -> bool {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&completion.id) {
            Some(order) => {
                order.status = completion.status;
                order.qty = completion.total_qty;
                order.updated_at = Utc::now();
                true
            }
            None => {
                orders.insert(
                    completion.id.clone(),
                    TrackedOrder {
                        id: completion.id.clone(),
                        products: Vec::new(),
                        qty: completion.total_qty,
                        status: completion.status,
                        updated_at: Utc::now(),
                    },
                );
                false
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<TrackedOrder> {
        self.orders.read().await.get(id).cloned()
    }
}

/// Handles [`OrderCompleted`] messages from the products queue.
pub struct CompletionHandler {
    tracker: OrderTracker,
}

impl CompletionHandler {
    pub fn new(tracker: OrderTracker) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl MessageHandler<OrderCompleted> for CompletionHandler {
    async fn handle(&self, completion: OrderCompleted) -> anyhow::Result<()> {
        if self.tracker.complete(&completion).await {
            info!(order_id = %completion.id, "Order completed");
        } else {
            warn!(order_id = %completion.id, "Completion for an order not placed here");
        }
        Ok(())
    }
}

fn default_qty() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct BuyRequest {
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default = "default_qty")]
    pub qty: u32,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone)]
struct ProductState {
    tracker: OrderTracker,
    publisher: Publisher,
    orders_queue: Arc<str>,
}

async fn buy(State(state): State<ProductState>, Json(buy): Json<BuyRequest>) -> Response {
    if buy.qty == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "qty must be at least 1" })),
        )
            .into_response();
    }

    let order = OrderRequest::new(buy.products, buy.qty, buy.username);
    state.tracker.track(&order).await;

    match state.publisher.publish(&state.orders_queue, &order).await {
        Ok(()) => {
            info!(order_id = %order.id, "Order submitted");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "orderId": order.id, "status": OrderStatus::Pending })),
            )
                .into_response()
        }
        Err(e) => {
            state.tracker.forget(&order.id).await;
            let status = match &e {
                BrokerError::SerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn get_order(State(state): State<ProductState>, Path(id): Path<String>) -> Response {
    match state.tracker.get(&id).await {
        Some(order) => Json(order).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Order {} not found", id) })),
        )
            .into_response(),
    }
}

pub fn router(tracker: OrderTracker, publisher: Publisher, orders_queue: &str) -> Router {
    Router::new()
        .route("/products/buy", post(buy))
        .route("/products/orders/{id}", get(get_order))
        .with_state(ProductState {
            tracker,
            publisher,
            orders_queue: Arc::from(orders_queue),
        })
}
