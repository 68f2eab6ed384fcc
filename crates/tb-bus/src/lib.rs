//! TenantBus
//!
//! Tenant-scoped dispatch on top of an AMQP broker:
//! - NamingConventions: exchange, routing key, queue, error and retry names
//! - TenantClientPool: one client per tenant virtual host, resolved by tenant id
//! - BusPublisher: `send` (commands) and `publish` (events) to exactly one tenant
//! - Pipeline: staged inbound middleware, including RetryContextMiddleware
//! - Settlement: ack, retry-later or error exchange, planned from the pipeline outcome
//! - amqp (feature): lapin-backed client factory and subscriber

pub mod error;
pub mod message;
pub mod naming;
pub mod client;
pub mod pool;
pub mod publisher;
pub mod pipeline;
pub mod retry;
pub mod settlement;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::BusError;
pub use message::{Message, Command, Event, MessageKind, MessageDescriptor, OutboundMessage};
pub use naming::{NamingConventions, NameSet, snake_case};
pub use client::{BusClient, ClientFactory};
pub use pool::{TenantClientPool, TenantClientHandle};
pub use publisher::BusPublisher;
pub use pipeline::{
    Pipeline, PipeContext, MessageContext, MessageHandler, Middleware, Next,
    StageMarker, Acknowledgement, RetryInformation, Headers,
};
pub use retry::RetryContextMiddleware;
pub use settlement::{plan_settlement, Disposition, Settlement};

pub use tb_common::{CorrelationContext, TenantConfig};

pub type Result<T> = std::result::Result<T, BusError>;
