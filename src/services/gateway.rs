//! API gateway: forwards requests to backend services by path prefix.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Route;

/// Largest request body buffered for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Prefix routes, longest prefix first.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Matches whole path segments, so `/products` covers `/products/42`
    /// but not `/productsfoo`.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| {
            path.strip_prefix(route.prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.prefix.as_str()).collect()
    }
}

#[derive(Clone)]
struct GatewayState {
    routes: Arc<RouteTable>,
    client: reqwest::Client,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn proxy(State(state): State<GatewayState>, request: Request) -> Response {
    let path = request.uri().path();
    let Some(route) = state.routes.resolve(path) else {
        return error_response(StatusCode::NOT_FOUND, format!("No route for {}", path));
    };

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(path);
    let url = format!("{}{}", route.target, path_and_query);

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body for {}: {}", url, e);
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };

    // Host is forwarded as sent by the client
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    debug!(method = %parts.method, %url, "Forwarding request");
    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match upstream {
        Ok(upstream) => {
            let status = upstream.status();
            let mut headers = upstream.headers().clone();
            strip_hop_by_hop(&mut headers);

            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            warn!(%url, "Upstream unreachable: {}", e);
            error_response(StatusCode::BAD_GATEWAY, format!("Upstream unreachable: {}", e))
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "OK",
        "service": "API Gateway",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn index(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "message": "API Gateway is running",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": state.routes.prefixes(),
    }))
}

pub fn router(routes: Vec<Route>) -> Router {
    let state = GatewayState {
        routes: Arc::new(RouteTable::new(routes)),
        client: reqwest::Client::new(),
    };

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .fallback(proxy)
        .with_state(state)
}
