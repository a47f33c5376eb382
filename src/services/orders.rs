//! Order service: records orders arriving on the orders queue and announces
//! completion on the products queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::message::{OrderCompleted, OrderRequest, OrderStatus};
use crate::rabbitmq::{MessageHandler, Publisher};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub products: Vec<String>,
    pub qty: u32,
    pub username: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    fn completed(request: OrderRequest) -> Self {
        Self {
            id: request.id,
            products: request.products,
            qty: request.qty,
            username: request.username,
            status: OrderStatus::Completed,
            created_at: Utc::now(),
        }
    }

    fn completion(&self) -> OrderCompleted {
        OrderCompleted {
            id: self.id.clone(),
            status: self.status,
            total_qty: self.qty,
            username: self.username.clone(),
            created_at: self.created_at,
        }
    }
}

/// In-memory order table keyed by order id.
#[derive(Clone, Default)]
pub struct OrderStore {
    orders: Arc<RwLock<HashMap<String, Order>>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `order` unless its id is already known. Returns the stored order
    /// and whether it was newly inserted.
    pub async fn insert(&self, order: Order) -> (Order, bool) {
        let mut orders = self.orders.write().await;
        match orders.get(&order.id) {
            Some(existing) => (existing.clone(), false),
            None => {
                orders.insert(order.id.clone(), order.clone());
                (order, true)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Order> {
        self.orders.read().await.get(id).cloned()
    }

    /// All orders, oldest first.
    pub async fn list(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.read().await.values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }
}

/// Handles [`OrderRequest`]s from the orders queue.
pub struct OrderHandler {
    store: OrderStore,
    publisher: Publisher,
    products_queue: String,
}

impl OrderHandler {
    pub fn new(store: OrderStore, publisher: Publisher, products_queue: impl Into<String>) -> Self {
        Self {
            store,
            publisher,
            products_queue: products_queue.into(),
        }
    }
}

#[async_trait]
impl MessageHandler<OrderRequest> for OrderHandler {
    async fn handle(&self, request: OrderRequest) -> anyhow::Result<()> {
        anyhow::ensure!(request.qty > 0, "order {} has zero quantity", request.id);

        let (order, created) = self.store.insert(Order::completed(request)).await;
        if created {
            info!(order_id = %order.id, qty = order.qty, "Order recorded");
        } else {
            info!(order_id = %order.id, "Order already recorded, re-announcing completion");
        }

        // the order is stored either way, so a lost completion is not a
        // reason to reject the delivery
        if let Err(e) = self
            .publisher
            .publish(&self.products_queue, &order.completion())
            .await
        {
            warn!(order_id = %order.id, "Order completion not published: {}", e);
        }
        Ok(())
    }
}

async fn list_orders(State(store): State<OrderStore>) -> Json<Vec<Order>> {
    Json(store.list().await)
}

async fn get_order(State(store): State<OrderStore>, Path(id): Path<String>) -> Response {
    match store.get(&id).await {
        Some(order) => Json(order).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Order {} not found", id) })),
        )
            .into_response(),
    }
}

pub fn router(store: OrderStore) -> Router {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/{id}", get(get_order))
        .with_state(store)
}
