use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Correlation Context
// ============================================================================

/// Metadata envelope carried alongside every command and event.
///
/// Serialized as camelCase JSON into the `message_context` header. `id` and
/// `correlationId` are mandatory, so a header that does not carry them is not
/// treated as a correlation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationContext {
    /// Identity of the message this context travels with
    pub id: Uuid,
    /// Shared by every message of one logical flow
    pub correlation_id: Uuid,
    /// Id of the message that caused this one
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Message name, e.g. `order_placed`
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Number of times the broker redelivered the message
    #[serde(default)]
    pub retries: u32,
}

impl CorrelationContext {
    /// Start a new flow: fresh message id and correlation id.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            correlation_id: id,
            causation_id: None,
            user_id: None,
            tenant_id: None,
            name: None,
            origin: None,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
            retries: 0,
        }
    }

    /// Context for a message emitted while handling `parent`.
    ///
    /// Keeps the correlation id, tenant and user; the parent becomes the cause.
    pub fn caused_by(parent: &CorrelationContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: parent.correlation_id,
            causation_id: Some(parent.id),
            user_id: parent.user_id.clone(),
            tenant_id: parent.tenant_id.clone(),
            name: None,
            origin: parent.origin.clone(),
            created_at: Utc::now(),
            metadata: parent.metadata.clone(),
            retries: 0,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Broker connection parameters for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_hostnames")]
    pub hostnames: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential")]
    pub username: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default)]
    pub use_tls: bool,
    /// Heartbeat interval negotiated with the broker, in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

fn default_hostnames() -> Vec<String> { vec!["localhost".to_string()] }
fn default_port() -> u16 { 5672 }
fn default_credential() -> String { "guest".to_string() }
fn default_heartbeat() -> u16 { 60 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hostnames: default_hostnames(),
            port: default_port(),
            username: default_credential(),
            password: default_credential(),
            use_tls: false,
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

/// One configured tenant.
///
/// The virtual host doubles as the tenant id; `namespace` drives name derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub virtual_host: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(default = "default_confirm_timeout_ms")]
    pub publish_confirm_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub persistent_delivery_mode: bool,
    /// Delay before a message handed back with "retry later" is redelivered
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
}

fn default_confirm_timeout_ms() -> u64 { 1000 }
fn default_true() -> bool { true }
fn default_retry_delay_ms() -> u64 { 5000 }
fn default_prefetch() -> u16 { 50 }

impl TenantConfig {
    pub fn new(virtual_host: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            virtual_host: virtual_host.into(),
            namespace: namespace.into(),
            connection: ConnectionConfig::default(),
            publish_confirm_timeout_ms: default_confirm_timeout_ms(),
            persistent_delivery_mode: true,
            retry_delay_ms: default_retry_delay_ms(),
            prefetch_count: default_prefetch(),
        }
    }

    /// Tenant identifier; the broker virtual host
    pub fn tenant_id(&self) -> &str {
        &self.virtual_host
    }
}
