//! AMQP subscriber
//!
//! Consumes one queue per message type, runs every delivery through the
//! [`Pipeline`] and carries out the [`Settlement`] planned from the outcome:
//! - `Ack`: acknowledged
//! - `Retry`: republished through the retry exchange into a TTL queue
//!   that dead-letters back to the original exchange, then acknowledged
//! - `Error`: published to the error exchange, then acknowledged
//!
//! If republishing fails the delivery is nacked with requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tb_common::TenantConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::headers::{decode_delivery, headers_from_table, table_from_headers};
use super::{declare_exchange, publish_confirmed, AmqpBusClient};
use crate::message::MessageDescriptor;
use crate::naming::NamingConventions;
use crate::pipeline::{Headers, MessageHandler, PipeContext, Pipeline};
use crate::settlement::{plan_settlement, Disposition, Settlement, RETRY_QUEUE_HEADER};
use crate::Result;

/// Arguments for a retry queue holding messages for `delay` before
/// dead-lettering them to `exchange`
pub fn retry_queue_arguments(exchange: &str, delay: Duration) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongLongInt(delay.as_millis().min(i64::MAX as u128) as i64),
    );
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    args
}

/// Binding arguments matching only messages addressed to `retry_queue`
pub fn retry_binding_arguments(retry_queue: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(ShortString::from("x-match"), AMQPValue::LongString(LongString::from("all")));
    args.insert(
        ShortString::from(RETRY_QUEUE_HEADER),
        AMQPValue::LongString(LongString::from(retry_queue)),
    );
    args
}

/// Consumes tenant queues on a dedicated channel
#[derive(Clone)]
pub struct AmqpSubscriber {
    channel: Channel,
    tenant: TenantConfig,
    conventions: NamingConventions,
    pipeline: Arc<Pipeline>,
}

impl AmqpSubscriber {
    pub async fn new(client: &AmqpBusClient, pipeline: Pipeline) -> Result<Self> {
        let channel = client.open_channel().await?;
        channel
            .basic_qos(client.tenant().prefetch_count, BasicQosOptions::default())
            .await?;

        Ok(Self {
            channel,
            tenant: client.tenant().clone(),
            conventions: client.conventions().clone(),
            pipeline: Arc::new(pipeline),
        })
    }

    fn tenant_id(&self) -> &str {
        self.tenant.tenant_id()
    }

    /// Declare, bind and start consuming the queue for `descriptor`.
    ///
    /// The returned task runs until `shutdown` fires or the consumer stream ends.
    pub async fn subscribe(
        &self,
        descriptor: MessageDescriptor,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let exchange = self.conventions.exchange_name(&descriptor);
        let routing_key = self.conventions.routing_key(&descriptor);
        let queue = self.conventions.queue_name(&descriptor);

        declare_exchange(&self.channel, &exchange, ExchangeKind::Topic).await?;
        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_bind(
                &queue,
                &exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            tenant_id = %self.tenant_id(),
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Consumer started"
        );

        let this = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = consumer.next() => {
                        match next {
                            Some(Ok(delivery)) => this.process(delivery, handler.as_ref()).await,
                            Some(Err(e)) => {
                                error!(queue = %queue, error = %e, "Consumer error");
                                break;
                            }
                            None => {
                                warn!(queue = %queue, "Consumer stream ended");
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!(queue = %queue, "Consumer shutting down");
                        break;
                    }
                }
            }
        }))
    }

    fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.tenant.retry_delay_ms)
    }

    async fn process(&self, delivery: Delivery, handler: &dyn MessageHandler) {
        let exchange = delivery.exchange.as_str().to_string();
        let routing_key = delivery.routing_key.as_str().to_string();

        let (ctx, outcome) = match decode_delivery(
            self.tenant_id(),
            &exchange,
            &routing_key,
            delivery.properties.headers().as_ref(),
            &delivery.data,
        ) {
            Ok(mut ctx) => {
                let outcome = self.pipeline.execute(&mut ctx, handler).await;
                (ctx, outcome)
            }
            Err(e) => {
                let headers = headers_from_table(delivery.properties.headers().as_ref());
                let ctx = PipeContext::new(
                    self.tenant_id(),
                    &exchange,
                    &routing_key,
                    headers,
                    serde_json::Value::Null,
                );
                (ctx, Err(e))
            }
        };

        let plan = plan_settlement(
            &outcome,
            &ctx,
            &self.conventions,
            self.default_retry_delay(),
            Utc::now(),
        );
        let settled = self.settle(plan, &ctx, &delivery).await;

        let acked = match Disposition::after(&settled) {
            Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
            Disposition::NackRequeue => {
                if let Err(e) = &settled {
                    warn!(routing_key = %routing_key, error = %e, "Could not settle delivery, requeueing");
                }
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };

        if let Err(e) = acked {
            error!(routing_key = %routing_key, error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn settle(&self, plan: Settlement, ctx: &PipeContext, delivery: &Delivery) -> Result<()> {
        match plan {
            Settlement::Ack => Ok(()),
            Settlement::Retry {
                retry_exchange,
                retry_queue,
                dead_letter_exchange,
                delay,
                routing_key,
                headers,
            } => {
                declare_exchange(&self.channel, &retry_exchange, ExchangeKind::Headers).await?;
                self.channel
                    .queue_declare(
                        &retry_queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        retry_queue_arguments(&dead_letter_exchange, delay),
                    )
                    .await?;
                self.channel
                    .queue_bind(
                        &retry_queue,
                        &retry_exchange,
                        "",
                        QueueBindOptions::default(),
                        retry_binding_arguments(&retry_queue),
                    )
                    .await?;

                self.republish(&retry_exchange, &routing_key, delivery, &headers)
                    .await?;

                debug!(
                    routing_key = %routing_key,
                    retry_queue = %retry_queue,
                    attempt = ctx.retry.number_of_retries + 1,
                    "Delivery scheduled for retry"
                );
                Ok(())
            }
            Settlement::Error {
                error_exchange,
                routing_key,
                headers,
                reason,
            } => {
                declare_exchange(&self.channel, &error_exchange, ExchangeKind::Topic).await?;
                self.republish(&error_exchange, &routing_key, delivery, &headers)
                    .await?;

                warn!(
                    exchange = %ctx.exchange,
                    routing_key = %routing_key,
                    error_exchange = %error_exchange,
                    reason = %reason,
                    "Delivery moved to error exchange"
                );
                Ok(())
            }
        }
    }

    /// Publish the delivery body again, keeping its properties but replacing the headers
    async fn republish(
        &self,
        exchange: &str,
        routing_key: &str,
        delivery: &Delivery,
        headers: &Headers,
    ) -> Result<()> {
        let properties: BasicProperties = delivery
            .properties
            .clone()
            .with_headers(table_from_headers(headers));

        publish_confirmed(
            &self.channel,
            exchange,
            routing_key,
            &delivery.data,
            properties,
            Duration::from_millis(self.tenant.publish_confirm_timeout_ms),
        )
        .await
    }
}

impl std::fmt::Debug for AmqpSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSubscriber")
            .field("tenant_id", &self.tenant_id())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_queue_arguments() {
        let args = retry_queue_arguments("acme", Duration::from_millis(5000));
        let headers = headers_from_table(Some(&args));

        assert_eq!(headers["x-message-ttl"], json!(5000));
        assert_eq!(headers["x-dead-letter-exchange"], json!("acme"));
    }

    #[test]
    fn test_retry_binding_matches_queue_header() {
        let args = retry_binding_arguments("acme.retry_for_acme_in_5000_ms");
        let headers = headers_from_table(Some(&args));

        assert_eq!(headers["x-match"], json!("all"));
        assert_eq!(headers[RETRY_QUEUE_HEADER], json!("acme.retry_for_acme_in_5000_ms"));
    }
}
