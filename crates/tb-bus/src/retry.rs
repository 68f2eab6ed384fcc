//! RetryContextMiddleware - copies the broker's retry counter into the
//! correlation context once the message has been deserialized.

use async_trait::async_trait;
use tracing::trace;

use crate::pipeline::{Acknowledgement, Middleware, Next, PipeContext, StageMarker};
use crate::Result;

/// Writes `RetryInformation::number_of_retries` into `CorrelationContext::retries`.
///
/// Contexts of any other shape are left alone. Processing always continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryContextMiddleware;

#[async_trait]
impl Middleware for RetryContextMiddleware {
    fn stage(&self) -> StageMarker {
        StageMarker::MessageDeserialized
    }

    fn name(&self) -> &str {
        "retry-context"
    }

    async fn invoke(&self, ctx: &mut PipeContext, next: Next<'_>) -> Result<Acknowledgement> {
        let retries = ctx.retry.number_of_retries;
        if let Some(correlation) = ctx.correlation_mut() {
            correlation.retries = retries;
        } else {
            trace!(routing_key = %ctx.routing_key, "No correlation context, retry count not propagated");
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        Headers, MessageContext, MessageHandler, Pipeline, MESSAGE_CONTEXT_HEADER,
        NUMBER_OF_RETRIES_HEADER,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tb_common::CorrelationContext;

    /// Records the retries value the handler observed
    struct ObservingHandler {
        calls: AtomicU32,
        seen_retries: AtomicU32,
    }

    impl ObservingHandler {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                seen_retries: AtomicU32::new(u32::MAX),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for ObservingHandler {
        async fn handle(&self, ctx: &mut PipeContext) -> Result<Acknowledgement> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(c) = ctx.correlation() {
                self.seen_retries.store(c.retries, Ordering::SeqCst);
            }
            Ok(Acknowledgement::Ack)
        }
    }

    fn delivery(retries: u32, context: serde_json::Value) -> PipeContext {
        let mut headers = Headers::new();
        headers.insert(NUMBER_OF_RETRIES_HEADER.to_string(), json!(retries));
        headers.insert(MESSAGE_CONTEXT_HEADER.to_string(), context);
        PipeContext::new("acme", "acme", "acme.order_placed", headers, json!({ "orderId": "o-1" }))
    }

    #[tokio::test]
    async fn test_writes_retry_count_into_correlation_context() {
        let original = CorrelationContext::new().with_tenant("acme");
        let mut ctx = delivery(4, serde_json::to_value(&original).unwrap());
        let handler = ObservingHandler::new();

        let ack = Pipeline::with_defaults().execute(&mut ctx, &handler).await.unwrap();

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.seen_retries.load(Ordering::SeqCst), 4);

        let updated = ctx.correlation().unwrap();
        assert_eq!(updated.retries, 4);
        assert_eq!(updated.id, original.id);
        assert_eq!(updated.tenant_id, original.tenant_id);
    }

    #[tokio::test]
    async fn test_overwrites_stale_retry_count() {
        let mut original = CorrelationContext::new();
        original.retries = 9;
        let mut ctx = delivery(1, serde_json::to_value(&original).unwrap());

        Pipeline::with_defaults().execute(&mut ctx, &ObservingHandler::new()).await.unwrap();

        assert_eq!(ctx.correlation().unwrap().retries, 1);
    }

    #[tokio::test]
    async fn test_foreign_context_left_untouched() {
        let foreign = json!({ "traceId": "t-1", "retries": 7 });
        let mut ctx = delivery(2, foreign.clone());
        let handler = ObservingHandler::new();

        let ack = Pipeline::with_defaults().execute(&mut ctx, &handler).await.unwrap();

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.message_context, Some(MessageContext::Foreign(foreign)));
    }

    #[tokio::test]
    async fn test_missing_context_still_reaches_handler() {
        let mut ctx = PipeContext::new("acme", "acme", "acme.x", Headers::new(), json!(null));
        let handler = ObservingHandler::new();

        Pipeline::with_defaults().execute(&mut ctx, &handler).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(ctx.message_context.is_none());
    }

    #[test]
    fn test_runs_after_deserialization() {
        assert_eq!(RetryContextMiddleware.stage(), StageMarker::MessageDeserialized);
    }
}
