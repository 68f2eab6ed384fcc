//! TenantBus API
//!
//! HTTP API endpoints for:
//! - Kubernetes probes (liveness/readiness)
//! - Prometheus metrics
//! - Tenant listing
//! - Command and event dispatch to a single tenant

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tb_bus::{
    BusError, BusPublisher, CorrelationContext, MessageDescriptor, MessageKind, OutboundMessage,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub publisher: BusPublisher,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(publisher: BusPublisher) -> Self {
        Self {
            publisher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Simple health response for basic health check
#[derive(Debug, Serialize)]
pub struct SimpleHealthResponse {
    /// UP or DEGRADED
    pub status: String,
    pub version: String,
    pub tenants: usize,
}

/// Kubernetes probe response
#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    /// LIVE, READY or NOT_READY
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResponse {
    pub tenant_id: String,
    pub namespace: String,
    pub healthy: bool,
}

/// Body of a command or event dispatch
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    /// Message body, forwarded as-is
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the tenant's default namespace for this message type
    pub namespace: Option<String>,
    /// Join an existing flow instead of starting a new one
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub tenant_id: String,
    pub kind: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Handler errors, rendered as JSON with a stable code
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// The request body could not be read as a dispatch request
    InvalidPayload(String),
    Bus(BusError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidPayload(rejection.body_text())
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        ApiError::Bus(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::InvalidPayload(msg) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", msg),
            ApiError::Bus(err) => {
                let (status, code) = match &err {
                    BusError::UnknownTenant { .. } => (StatusCode::NOT_FOUND, "UNKNOWN_TENANT"),
                    BusError::Serialization(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
                    BusError::AmbiguousTenant { .. } => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "AMBIGUOUS_TENANT")
                    }
                    BusError::ConfirmTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "CONFIRM_TIMEOUT"),
                    BusError::Transport(_) | BusError::PublishNacked { .. } => {
                        (StatusCode::BAD_GATEWAY, "BROKER_ERROR")
                    }
                    BusError::Handler { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "HANDLER_ERROR"),
                };
                if !err.is_caller_error() {
                    warn!(error = %err, code = code, "Dispatch failed");
                }
                (status, code, err.to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

/// Create the full router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Basic health
        .route("/health", get(health_handler))
        // Kubernetes probes
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        // Tenants
        .route("/api/tenants", get(list_tenants))
        .route("/api/tenants/:tenant_id/commands/:message_type", post(send_command))
        .route("/api/tenants/:tenant_id/events/:message_type", post(publish_event))
        .with_state(state)
}

fn all_clients_healthy(state: &AppState) -> bool {
    state
        .publisher
        .pool()
        .handles()
        .iter()
        .all(|h| h.client().is_healthy())
}

async fn health_handler(State(state): State<AppState>) -> Json<SimpleHealthResponse> {
    let status = if all_clients_healthy(&state) { "UP" } else { "DEGRADED" };

    Json(SimpleHealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tenants: state.publisher.pool().len(),
    })
}

async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "LIVE".to_string(),
    })
}

/// Ready once every tenant has a healthy client
async fn readiness_probe(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let ready = !state.publisher.pool().is_empty() && all_clients_healthy(&state);

    if ready {
        (
            StatusCode::OK,
            Json(ProbeResponse {
                status: "READY".to_string(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                status: "NOT_READY".to_string(),
            }),
        )
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn list_tenants(State(state): State<AppState>) -> Json<Vec<TenantResponse>> {
    let tenants = state
        .publisher
        .pool()
        .handles()
        .iter()
        .map(|h| TenantResponse {
            tenant_id: h.tenant_id().to_string(),
            namespace: h.namespace().to_string(),
            healthy: h.client().is_healthy(),
        })
        .collect();

    Json(tenants)
}

async fn send_command(
    State(state): State<AppState>,
    Path((tenant_id, message_type)): Path<(String, String)>,
    request: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let Json(request) = request?;
    dispatch(&state, MessageKind::Command, &tenant_id, &message_type, request).await
}

async fn publish_event(
    State(state): State<AppState>,
    Path((tenant_id, message_type)): Path<(String, String)>,
    request: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let Json(request) = request?;
    dispatch(&state, MessageKind::Event, &tenant_id, &message_type, request).await
}

/// Message type names become broker names, so only identifier characters are accepted
fn validate_message_type(message_type: &str) -> Result<(), ApiError> {
    let valid = message_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && message_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "Invalid message type: '{}'",
            message_type
        )))
    }
}

async fn dispatch(
    state: &AppState,
    kind: MessageKind,
    tenant_id: &str,
    message_type: &str,
    request: DispatchRequest,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    validate_message_type(message_type)?;

    let mut descriptor = MessageDescriptor::new(message_type);
    if let Some(namespace) = request.namespace {
        descriptor = descriptor.with_namespace(namespace);
    }

    let mut context = CorrelationContext::new()
        .with_tenant(tenant_id)
        .with_name(tb_bus::snake_case(message_type))
        .with_origin("http");
    if let Some(correlation_id) = request.correlation_id {
        context = context.with_correlation_id(correlation_id);
    }
    if let Some(causation_id) = request.causation_id {
        context = context.with_causation_id(causation_id);
    }
    if let Some(user_id) = request.user_id {
        context = context.with_user(user_id);
    }

    let handle = state.publisher.pool().resolve(tenant_id)?;
    let exchange = handle.conventions().exchange_name(&descriptor);
    let routing_key = handle.conventions().routing_key(&descriptor);

    let response = DispatchResponse {
        message_id: context.id,
        correlation_id: context.correlation_id,
        tenant_id: tenant_id.to_string(),
        kind: kind.as_str().to_string(),
        exchange,
        routing_key,
    };

    let message = OutboundMessage::new(kind, descriptor, request.payload, context);
    state.publisher.dispatch(message, tenant_id).await?;

    info!(
        tenant_id = %tenant_id,
        kind = kind.as_str(),
        message_id = %response.message_id,
        routing_key = %response.routing_key,
        "Dispatched via API"
    );

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_message_type() {
        assert!(validate_message_type("CreateOrder").is_ok());
        assert!(validate_message_type("order_placed").is_ok());
        assert!(validate_message_type("Order2").is_ok());

        assert!(validate_message_type("").is_err());
        assert!(validate_message_type("2Order").is_err());
        assert!(validate_message_type("order.placed").is_err());
        assert!(validate_message_type("order placed").is_err());
    }
}
