//! HttpTransport against a live local server.

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, put};
use axum::{Json, Router};
use fieldsync_client::{
    HttpTransport, StaticToken, Transport, TransportError, TransportRequest,
};
use fieldsync_engine::Method;
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn update_order(
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({ "id": id, "version": 5, "auth": auth, "received": body }))
}

async fn stale_order() -> (StatusCode, Json<Value>) {
    (
        StatusCode::CONFLICT,
        Json(json!({ "id": "9", "version": 7, "status": "cancelled" })),
    )
}

async fn remove_order() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn health() -> &'static str {
    "ok"
}

/// Serve the test routes on an ephemeral port and return the base URL.
async fn serve() -> String {
    let app = Router::new()
        .route("/work-orders/{id}", patch(update_order).delete(remove_order))
        .route("/stale", put(stale_order))
        .route("/health", get(health));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn test_json_body_and_bearer_token_reach_server() {
    let transport = HttpTransport::new(Some(serve().await));
    let request = TransportRequest::new(Method::Patch, "/work-orders/17")
        .with_payload(json!({ "status": "en_route", "version": 4 }))
        .authorized(&StaticToken::new("secret"));

    let response = transport.execute(request).await.unwrap();

    assert!(response.is_success());
    assert_eq!(response.body["id"], "17");
    assert_eq!(response.body["auth"], "Bearer secret");
    assert_eq!(
        response.body["received"],
        json!({ "status": "en_route", "version": 4 })
    );
}

#[tokio::test]
async fn test_conflict_status_and_body_are_returned() {
    let transport = HttpTransport::new(Some(serve().await));

    let response = transport
        .execute(TransportRequest::new(Method::Put, "stale").with_payload(json!({})))
        .await
        .unwrap();

    assert_eq!(response.status, 409);
    assert!(!response.is_success());
    assert_eq!(response.body["version"], 7);
}

#[tokio::test]
async fn test_empty_and_plain_bodies() {
    let transport = HttpTransport::new(Some(serve().await));

    let deleted = transport
        .execute(TransportRequest::new(Method::Delete, "/work-orders/17"))
        .await
        .unwrap();
    assert_eq!(deleted.status, 204);
    assert_eq!(deleted.body, Value::Null);

    let health = transport
        .execute(TransportRequest::new(Method::Get, "/health"))
        .await
        .unwrap();
    assert_eq!(health.body, json!("ok"));
}

#[tokio::test]
async fn test_unknown_route_is_a_client_error() {
    let transport = HttpTransport::new(Some(serve().await));

    let response = transport
        .execute(TransportRequest::new(Method::Post, "/nowhere").with_payload(json!({})))
        .await
        .unwrap();

    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_relative_endpoint_without_base_is_invalid() {
    let transport = HttpTransport::new(None);

    let err = transport
        .execute(TransportRequest::new(Method::Get, "/health"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = HttpTransport::new(None);
    let err = transport
        .execute(TransportRequest::new(
            Method::Get,
            format!("http://{addr}/health"),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Unreachable(_)));
}
