//! API Endpoint Tests
//!
//! Tests for:
//! - Health endpoints (basic, liveness, readiness)
//! - Tenant listing
//! - Command and event dispatch
//! - Error mapping for unknown tenants and broker failures
//! - Rejected request bodies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use tb_api::{create_router, AppState};
use tb_bus::{
    BusClient, BusError, BusPublisher, MessageKind, NamingConventions, OutboundMessage,
    TenantClientHandle, TenantClientPool,
};

/// Mock client recording published messages
struct MockClient {
    published: parking_lot::Mutex<Vec<OutboundMessage>>,
    healthy: AtomicBool,
    fail_with_transport: bool,
}

impl MockClient {
    fn new() -> Self {
        Self {
            published: parking_lot::Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            fail_with_transport: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail_with_transport: true,
            ..Self::new()
        }
    }

    fn published_count(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl BusClient for MockClient {
    async fn publish(&self, message: OutboundMessage) -> tb_bus::Result<()> {
        if self.fail_with_transport {
            return Err(BusError::transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel closed",
            )));
        }
        self.published.lock().push(message);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

struct TestApp {
    app: axum::Router,
    acme: Arc<MockClient>,
    globex: Arc<MockClient>,
}

fn create_test_app_with(acme: MockClient) -> TestApp {
    let acme = Arc::new(acme);
    let globex = Arc::new(MockClient::new());

    let pool = TenantClientPool::from_handles(vec![
        TenantClientHandle::new(
            "acme",
            NamingConventions::new("acme", "orders-service"),
            acme.clone(),
        ),
        TenantClientHandle::new(
            "globex",
            NamingConventions::new("", "orders-service"),
            globex.clone(),
        ),
    ])
    .unwrap();

    let app = create_router(AppState::new(BusPublisher::new(Arc::new(pool))));

    TestApp { app, acme, globex }
}

fn create_test_app() -> TestApp {
    create_test_app_with(MockClient::new())
}

async fn get_body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ============================================================================
// Health Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let TestApp { app, .. } = create_test_app();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "UP");
    assert_eq!(json["tenants"], 2);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_liveness_probe() {
    let TestApp { app, .. } = create_test_app();

    let response = app.oneshot(get("/health/live")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "LIVE");
}

#[tokio::test]
async fn test_readiness_probe() {
    let TestApp { app, .. } = create_test_app();

    let response = app.oneshot(get("/health/ready")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "READY");
}

#[tokio::test]
async fn test_readiness_fails_when_a_tenant_is_disconnected() {
    let TestApp { app, acme, .. } = create_test_app();
    acme.healthy.store(false, Ordering::SeqCst);

    let response = app.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "NOT_READY");

    let response = app.oneshot(get("/health")).await.unwrap();
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["status"], "DEGRADED");
}

#[tokio::test]
async fn test_metrics_endpoint_without_recorder() {
    let TestApp { app, .. } = create_test_app();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
}

// ============================================================================
// Tenant Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_list_tenants() {
    let TestApp { app, globex, .. } = create_test_app();
    globex.healthy.store(false, Ordering::SeqCst);

    let response = app.oneshot(get("/api/tenants")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = get_body_json(response.into_body()).await;
    let tenants = json.as_array().unwrap();
    assert_eq!(tenants.len(), 2);
    assert_eq!(tenants[0]["tenantId"], "acme");
    assert_eq!(tenants[0]["namespace"], "acme");
    assert_eq!(tenants[0]["healthy"], true);
    assert_eq!(tenants[1]["tenantId"], "globex");
    assert_eq!(tenants[1]["namespace"], "");
    assert_eq!(tenants[1]["healthy"], false);
}

// ============================================================================
// Dispatch Tests
// ============================================================================

#[tokio::test]
async fn test_send_command_to_one_tenant() {
    let TestApp { app, acme, globex } = create_test_app();

    let response = app
        .oneshot(post_json(
            "/api/tenants/acme/commands/CreateOrder",
            serde_json::json!({ "payload": { "orderId": "o-1" }, "userId": "u-7" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["tenantId"], "acme");
    assert_eq!(json["kind"], "command");
    assert_eq!(json["exchange"], "acme");
    assert_eq!(json["routingKey"], "acme.create_order");

    assert_eq!(acme.published_count(), 1);
    assert_eq!(globex.published_count(), 0);

    let published = acme.published.lock();
    assert_eq!(published[0].kind, MessageKind::Command);
    assert_eq!(published[0].body["orderId"], "o-1");
    assert_eq!(published[0].context.tenant_id.as_deref(), Some("acme"));
    assert_eq!(published[0].context.user_id.as_deref(), Some("u-7"));
    assert_eq!(json["messageId"], published[0].context.id.to_string());
}

#[tokio::test]
async fn test_publish_event_with_namespace_and_correlation() {
    let TestApp { app, acme, globex } = create_test_app();
    let correlation_id = uuid::Uuid::new_v4();

    let response = app
        .oneshot(post_json(
            "/api/tenants/globex/events/CustomerCreated",
            serde_json::json!({
                "payload": { "customerId": "c-1" },
                "namespace": "customers",
                "correlationId": correlation_id,
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["kind"], "event");
    assert_eq!(json["exchange"], "customers");
    assert_eq!(json["routingKey"], "customers.customer_created");
    assert_eq!(json["correlationId"], correlation_id.to_string());

    assert_eq!(globex.published_count(), 1);
    assert_eq!(acme.published_count(), 0);
    assert_eq!(globex.published.lock()[0].context.correlation_id, correlation_id);
}

#[tokio::test]
async fn test_dispatch_to_unknown_tenant_returns_404() {
    let TestApp { app, acme, globex } = create_test_app();

    let response = app
        .oneshot(post_json(
            "/api/tenants/umbrella/commands/CreateOrder",
            serde_json::json!({ "payload": {} }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["code"], "UNKNOWN_TENANT");

    assert_eq!(acme.published_count(), 0);
    assert_eq!(globex.published_count(), 0);
}

#[tokio::test]
async fn test_invalid_message_type_returns_400() {
    let TestApp { app, acme, .. } = create_test_app();

    let response = app
        .oneshot(post_json(
            "/api/tenants/acme/commands/create.order",
            serde_json::json!({ "payload": {} }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(acme.published_count(), 0);
}

#[tokio::test]
async fn test_broker_failure_returns_502() {
    let TestApp { app, globex, .. } = create_test_app_with(MockClient::failing());

    let response = app
        .oneshot(post_json(
            "/api/tenants/acme/commands/CreateOrder",
            serde_json::json!({ "payload": {} }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["code"], "BROKER_ERROR");
    assert!(json["error"].as_str().unwrap().contains("channel closed"));
    assert_eq!(globex.published_count(), 0);
}

// ============================================================================
// Request Body Tests
// ============================================================================

async fn assert_invalid_payload(response: axum::response::Response) {
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = get_body_json(response.into_body()).await;
    assert_eq!(json["code"], "INVALID_PAYLOAD");
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_malformed_body_returns_json_400() {
    let TestApp { app, acme, .. } = create_test_app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/tenants/acme/commands/CreateOrder")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_invalid_payload(response).await;
    assert_eq!(acme.published_count(), 0);
}

#[tokio::test]
async fn test_non_uuid_correlation_id_returns_json_400() {
    let TestApp { app, acme, .. } = create_test_app();

    let response = app
        .oneshot(post_json(
            "/api/tenants/acme/commands/CreateOrder",
            serde_json::json!({ "payload": {}, "correlationId": "not-a-uuid" }),
        ))
        .await
        .unwrap();

    assert_invalid_payload(response).await;
    assert_eq!(acme.published_count(), 0);
}

#[tokio::test]
async fn test_missing_content_type_returns_json_400() {
    let TestApp { app, globex, .. } = create_test_app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/tenants/globex/events/CustomerCreated")
        .body(Body::from(r#"{"payload":{}}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_invalid_payload(response).await;
    assert_eq!(globex.published_count(), 0);
}
