use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_qty() -> u32 {
    1
}

/// Published to the orders queue when a customer buys.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OrderRequest {
    pub id: String,
    #[serde(default = "default_qty")]
    pub qty: u32,
    /// Product ids in the order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl OrderRequest {
    /// A request for `products` with a fresh order id.
    pub fn new(products: Vec<String>, qty: u32, username: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            qty,
            products,
            username,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

/// Published to the products queue once the order service has recorded an order.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OrderCompleted {
    pub id: String,
    pub status: OrderStatus,
    pub total_qty: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
}
