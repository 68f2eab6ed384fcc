//! BusPublisher - tenant-addressed dispatch of commands and events
//!
//! Every call resolves exactly one tenant before anything is written. A
//! failed resolution means nothing was sent. Transport errors are returned
//! to the caller untouched: retrying is the broker client's job.

use std::sync::Arc;

use tb_common::CorrelationContext;
use tracing::debug;

use crate::message::{Command, Event, OutboundMessage};
use crate::pool::TenantClientPool;
use crate::Result;

#[derive(Debug, Clone)]
pub struct BusPublisher {
    pool: Arc<TenantClientPool>,
}

impl BusPublisher {
    pub fn new(pool: Arc<TenantClientPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<TenantClientPool> {
        &self.pool
    }

    /// Deliver a command to the single tenant named by `tenant_id`
    pub async fn send<C: Command>(
        &self,
        command: &C,
        context: &CorrelationContext,
        tenant_id: &str,
    ) -> Result<()> {
        let message = OutboundMessage::command(command, context)?;
        self.dispatch(message, tenant_id).await
    }

    /// Publish an event on the tenant named by `tenant_id` only
    pub async fn publish<E: Event>(
        &self,
        event: &E,
        context: &CorrelationContext,
        tenant_id: &str,
    ) -> Result<()> {
        let message = OutboundMessage::event(event, context)?;
        self.dispatch(message, tenant_id).await
    }

    /// Untyped entry point for messages whose type is only known at runtime
    pub async fn dispatch(&self, message: OutboundMessage, tenant_id: &str) -> Result<()> {
        let handle = self.pool.resolve(tenant_id)?;
        let kind = message.kind;
        let message_id = message.context.id;

        handle.client().publish(message).await?;

        metrics::counter!(
            "tb_bus_dispatched_total",
            "kind" => kind.as_str(),
            "tenant" => tenant_id.to_string()
        )
        .increment(1);
        debug!(
            tenant_id = %tenant_id,
            kind = kind.as_str(),
            message_id = %message_id,
            "Message dispatched"
        );
        Ok(())
    }
}
