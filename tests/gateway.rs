// Gateway forwarding against a real local upstream.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{self, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

use rabbit_shop::config::Route;
use rabbit_shop::services::gateway;

async fn echo(request: Request) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    (
        StatusCode::CREATED,
        [("x-upstream", "product")],
        Json(json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "x_test": header("x-test"),
            "host": header("host"),
            "connection": header("connection"),
            "body": String::from_utf8_lossy(&body),
        })),
    )
}

/// Starts an upstream on an ephemeral port and returns its base URL.
async fn spawn_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(echo);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn routes(target: &str) -> Vec<Route> {
    vec![
        Route {
            prefix: "/products".to_string(),
            target: target.to_string(),
        },
        Route {
            prefix: "/orders".to_string(),
            target: "http://127.0.0.1:1".to_string(),
        },
    ]
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn get_is_forwarded_verbatim() {
    let upstream = spawn_upstream().await;
    let app = gateway::router(routes(&upstream));

    let response = app
        .oneshot(
            http::Request::get("/products/42?expand=true")
                .header("x-test", "1")
                .header("host", "shop.example")
                .header("connection", "keep-alive")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers().get("x-upstream"),
        Some(&HeaderValue::from_static("product"))
    );

    let body = json_body(response).await;
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/products/42");
    assert_eq!(body["query"], "expand=true");
    assert_eq!(body["x_test"], "1");
    assert_eq!(body["host"], "shop.example");
    assert_ne!(body["connection"], "keep-alive");
}

#[tokio::test]
async fn post_body_is_forwarded() {
    let upstream = spawn_upstream().await;
    let app = gateway::router(routes(&upstream));

    let response = app
        .oneshot(
            http::Request::post("/products/buy")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"qty":2}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    let body = json_body(response).await;
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/products/buy");
    assert_eq!(body["body"], r#"{"qty":2}"#);
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    let app = gateway::router(routes("http://127.0.0.1:9"));

    let response = app
        .oneshot(http::Request::get("/orders/1").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn health_is_answered_locally() {
    let app = gateway::router(routes("http://127.0.0.1:9"));

    let response = app
        .oneshot(http::Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "OK");
    assert_eq!(body["service"], "API Gateway");
}
