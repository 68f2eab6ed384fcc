//! AMQP transport backed by lapin
//!
//! One connection per tenant virtual host. Exchanges are declared lazily on
//! first publish; every publish waits for the broker confirm.

mod headers;
mod subscriber;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tb_common::TenantConfig;
use tracing::{debug, info, warn};

use crate::client::{BusClient, ClientFactory};
use crate::error::BusError;
use crate::message::OutboundMessage;
use crate::naming::{snake_case, NamingConventions};
use crate::pipeline::{Headers, MESSAGE_CONTEXT_HEADER};
use crate::Result;

pub use headers::{decode_delivery, headers_from_table, table_from_headers};
pub use subscriber::AmqpSubscriber;

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connection URI for one host of a tenant; the virtual host is URL-encoded
pub fn connection_uri(tenant: &TenantConfig, hostname: &str) -> String {
    let conn = &tenant.connection;
    format!(
        "{}://{}:{}@{}:{}/{}?heartbeat={}",
        if conn.use_tls { "amqps" } else { "amqp" },
        urlencoding::encode(&conn.username),
        urlencoding::encode(&conn.password),
        hostname,
        conn.port,
        urlencoding::encode(&tenant.virtual_host),
        conn.heartbeat_seconds,
    )
}

/// Try each configured hostname in order
async fn connect(tenant: &TenantConfig) -> Result<Connection> {
    let mut last_error = None;
    for hostname in &tenant.connection.hostnames {
        let uri = connection_uri(tenant, hostname);
        match Connection::connect(&uri, ConnectionProperties::default()).await {
            Ok(connection) => {
                info!(
                    tenant_id = %tenant.tenant_id(),
                    hostname = %hostname,
                    "Connected to broker"
                );
                return Ok(connection);
            }
            Err(e) => {
                warn!(
                    tenant_id = %tenant.tenant_id(),
                    hostname = %hostname,
                    error = %e,
                    "Broker connection attempt failed"
                );
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => BusError::transport(e),
        None => BusError::transport(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("tenant {} has no hostnames", tenant.tenant_id()),
        )),
    })
}

pub(crate) async fn declare_exchange(channel: &Channel, name: &str, kind: ExchangeKind) -> Result<()> {
    channel
        .exchange_declare(
            name,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    debug!(exchange = %name, "Exchange declared");
    Ok(())
}

/// Publish and wait for the broker confirm, bounded by `timeout`
pub(crate) async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
    properties: BasicProperties,
    timeout: Duration,
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            properties,
        )
        .await?;

    let confirmation = tokio::time::timeout(timeout, confirm)
        .await
        .map_err(|_| BusError::ConfirmTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })??;

    if confirmation.is_nack() {
        return Err(BusError::PublishNacked {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
    }
    Ok(())
}

/// lapin-backed client for one tenant
pub struct AmqpBusClient {
    tenant: TenantConfig,
    conventions: NamingConventions,
    connection: Connection,
    channel: Channel,
    declared_exchanges: DashSet<String>,
}

impl AmqpBusClient {
    pub async fn connect(tenant: &TenantConfig, conventions: NamingConventions) -> Result<Self> {
        let connection = connect(tenant).await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        Ok(Self {
            tenant: tenant.clone(),
            conventions,
            connection,
            channel,
            declared_exchanges: DashSet::new(),
        })
    }

    pub fn tenant(&self) -> &TenantConfig {
        &self.tenant
    }

    pub fn conventions(&self) -> &NamingConventions {
        &self.conventions
    }

    /// A fresh confirm-mode channel on this tenant's connection
    pub async fn open_channel(&self) -> Result<Channel> {
        let channel = self.connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn ensure_exchange(&self, exchange: &str) -> Result<()> {
        if self.declared_exchanges.contains(exchange) {
            return Ok(());
        }
        declare_exchange(&self.channel, exchange, ExchangeKind::Topic).await?;
        self.declared_exchanges.insert(exchange.to_string());
        Ok(())
    }

    fn properties(&self, message: &OutboundMessage) -> Result<BasicProperties> {
        let mut headers = Headers::new();
        headers.insert(
            MESSAGE_CONTEXT_HEADER.to_string(),
            serde_json::Value::String(serde_json::to_string(&message.context)?),
        );

        let delivery_mode = if self.tenant.persistent_delivery_mode {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        Ok(BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_message_id(message.context.id.to_string().into())
            .with_correlation_id(message.context.correlation_id.to_string().into())
            .with_kind(snake_case(&message.descriptor.name).into())
            .with_delivery_mode(delivery_mode)
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .with_headers(table_from_headers(&headers)))
    }
}

#[async_trait]
impl BusClient for AmqpBusClient {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let exchange = self.conventions.exchange_name(&message.descriptor);
        let routing_key = self.conventions.routing_key(&message.descriptor);
        self.ensure_exchange(&exchange).await?;

        let payload = serde_json::to_vec(&message.body)?;
        let properties = self.properties(&message)?;

        publish_confirmed(
            &self.channel,
            &exchange,
            &routing_key,
            &payload,
            properties,
            Duration::from_millis(self.tenant.publish_confirm_timeout_ms),
        )
        .await
    }

    fn is_healthy(&self) -> bool {
        self.is_connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_connected() {
            self.connection.close(200, "shutdown").await?;
        }
        Ok(())
    }
}

/// Opens one [`AmqpBusClient`] per tenant
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpClientFactory;

#[async_trait]
impl ClientFactory for AmqpClientFactory {
    async fn create_client(
        &self,
        tenant: &TenantConfig,
        conventions: &NamingConventions,
    ) -> Result<Arc<dyn BusClient>> {
        let client = AmqpBusClient::connect(tenant, conventions.clone()).await?;
        Ok(Arc::new(client))
    }
}
