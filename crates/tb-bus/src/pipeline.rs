//! Inbound message pipeline
//!
//! A delivery is decoded into a [`PipeContext`], then passed through the
//! registered middleware in stage order and finally to the handler. Each
//! middleware receives a [`Next`] and decides whether to continue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tb_common::CorrelationContext;

use crate::retry::RetryContextMiddleware;
use crate::Result;

/// Transport headers, decoded into JSON values
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Header carrying the serialized message context
pub const MESSAGE_CONTEXT_HEADER: &str = "message_context";
/// Retry counter maintained by this bus when a message is retried later
pub const NUMBER_OF_RETRIES_HEADER: &str = "x-number-of-retries";
/// First delivery time of a retried message
pub const ORIGINAL_DELIVERED_HEADER: &str = "x-original-delivered";
/// RabbitMQ dead-letter history
pub const X_DEATH_HEADER: &str = "x-death";

// ============================================================================
// Retry Information
// ============================================================================

/// The broker-side redelivery state of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryInformation {
    pub number_of_retries: u32,
    pub original_delivered: Option<DateTime<Utc>>,
}

impl RetryInformation {
    /// Read the retry counter from delivery headers.
    ///
    /// Prefers our own counter; falls back to summing the `count` fields of
    /// RabbitMQ's `x-death` entries. Missing or malformed headers mean zero.
    pub fn from_headers(headers: &Headers) -> Self {
        let number_of_retries = headers
            .get(NUMBER_OF_RETRIES_HEADER)
            .and_then(as_u32)
            .or_else(|| headers.get(X_DEATH_HEADER).map(death_count))
            .unwrap_or(0);

        let original_delivered = headers
            .get(ORIGINAL_DELIVERED_HEADER)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            number_of_retries,
            original_delivered,
        }
    }

    /// Headers for the next attempt of this message
    pub fn next_attempt_headers(&self, now: DateTime<Utc>) -> Headers {
        let mut headers = Headers::new();
        headers.insert(
            NUMBER_OF_RETRIES_HEADER.to_string(),
            serde_json::Value::from(self.number_of_retries.saturating_add(1)),
        );
        headers.insert(
            ORIGINAL_DELIVERED_HEADER.to_string(),
            serde_json::Value::from(self.original_delivered.unwrap_or(now).to_rfc3339()),
        );
        headers
    }
}

fn as_u32(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n.min(u32::MAX as u64) as u32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn death_count(value: &serde_json::Value) -> u32 {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("count").and_then(as_u32))
                .fold(0u32, |acc, c| acc.saturating_add(c))
        })
        .unwrap_or(0)
}

// ============================================================================
// Pipe Context
// ============================================================================

/// The message context as materialized from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContext {
    Correlation(CorrelationContext),
    /// Some other shape; carried along untouched
    Foreign(serde_json::Value),
}

impl MessageContext {
    /// Decode a `message_context` header value
    pub fn from_json(value: serde_json::Value) -> Self {
        match serde_json::from_value::<CorrelationContext>(value.clone()) {
            Ok(ctx) => MessageContext::Correlation(ctx),
            Err(_) => MessageContext::Foreign(value),
        }
    }

    pub fn correlation(&self) -> Option<&CorrelationContext> {
        match self {
            MessageContext::Correlation(ctx) => Some(ctx),
            MessageContext::Foreign(_) => None,
        }
    }
}

/// Everything known about one inbound delivery
#[derive(Debug, Clone)]
pub struct PipeContext {
    pub tenant_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: serde_json::Value,
    pub message_context: Option<MessageContext>,
    pub retry: RetryInformation,
}

impl PipeContext {
    /// Build a context from decoded headers and body.
    ///
    /// Retry information and the message context are taken from the headers.
    pub fn new(
        tenant_id: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        headers: Headers,
        body: serde_json::Value,
    ) -> Self {
        let retry = RetryInformation::from_headers(&headers);
        let message_context = headers
            .get(MESSAGE_CONTEXT_HEADER)
            .map(decode_context_header);

        Self {
            tenant_id: tenant_id.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers,
            body,
            message_context,
            retry,
        }
    }

    pub fn correlation(&self) -> Option<&CorrelationContext> {
        self.message_context.as_ref().and_then(MessageContext::correlation)
    }

    pub fn correlation_mut(&mut self) -> Option<&mut CorrelationContext> {
        match self.message_context.as_mut() {
            Some(MessageContext::Correlation(ctx)) => Some(ctx),
            _ => None,
        }
    }
}

/// The header may hold the context as a JSON object or as a JSON string
fn decode_context_header(value: &serde_json::Value) -> MessageContext {
    match value {
        serde_json::Value::String(raw) => match serde_json::from_str(raw) {
            Ok(parsed) => MessageContext::from_json(parsed),
            Err(_) => MessageContext::Foreign(value.clone()),
        },
        other => MessageContext::from_json(other.clone()),
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Where in the inbound flow a middleware runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageMarker {
    /// Raw delivery received, before the body is trusted
    MessageReceived,
    /// Body and message context materialized
    MessageDeserialized,
    /// Immediately before the handler
    HandlerInvoked,
}

/// What the consumer should do with the delivery after processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    /// Redeliver through the retry queue after `delay`, or after the
    /// tenant's `retry_delay_ms` when no delay is given
    RetryLater { delay: Option<Duration> },
    /// Route to the error exchange
    Reject { reason: String },
}

impl Acknowledgement {
    /// Retry after the tenant's configured delay
    pub fn retry_later() -> Self {
        Acknowledgement::RetryLater { delay: None }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Acknowledgement::RetryLater { delay: Some(delay) }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Acknowledgement::Reject {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &mut PipeContext) -> Result<Acknowledgement>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn stage(&self) -> StageMarker;

    fn name(&self) -> &str;

    async fn invoke(&self, ctx: &mut PipeContext, next: Next<'_>) -> Result<Acknowledgement>;
}

/// The rest of the pipeline after the current middleware
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    handler: &'a dyn MessageHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut PipeContext) -> Result<Acknowledgement> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    remaining: rest,
                    handler: self.handler,
                };
                middleware.invoke(ctx, next).await
            }
            None => self.handler.handle(ctx).await,
        }
    }
}

/// Ordered middleware chain shared by all consumers of a tenant
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Middleware run in stage order; registration order within a stage
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        middlewares.sort_by_key(|m| m.stage());
        Self { middlewares }
    }

    /// The standard chain: retry counter propagation
    pub fn with_defaults() -> Self {
        Self::new(vec![Arc::new(RetryContextMiddleware)])
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self.middlewares.sort_by_key(|m| m.stage());
        self
    }

    pub fn stages(&self) -> Vec<(StageMarker, &str)> {
        self.middlewares.iter().map(|m| (m.stage(), m.name())).collect()
    }

    pub async fn execute(
        &self,
        ctx: &mut PipeContext,
        handler: &dyn MessageHandler,
    ) -> Result<Acknowledgement> {
        Next {
            remaining: &self.middlewares,
            handler,
        }
        .run(ctx)
        .await
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.stages()).finish()
    }
}
