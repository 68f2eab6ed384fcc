//! Bus Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Unknown tenant: '{tenant_id}'")]
    UnknownTenant { tenant_id: String },

    #[error("Ambiguous tenant: '{tenant_id}' is configured more than once")]
    AmbiguousTenant { tenant_id: String },

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Publish to {exchange}/{routing_key} was nacked by the broker")]
    PublishNacked { exchange: String, routing_key: String },

    #[error("Publish confirm timed out after {timeout_ms}ms")]
    ConfirmTimeout { timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler error: {message}")]
    Handler { message: String },
}

impl BusError {
    pub fn unknown_tenant(tenant_id: impl Into<String>) -> Self {
        Self::UnknownTenant { tenant_id: tenant_id.into() }
    }

    pub fn ambiguous_tenant(tenant_id: impl Into<String>) -> Self {
        Self::AmbiguousTenant { tenant_id: tenant_id.into() }
    }

    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler { message: message.into() }
    }

    /// Errors the caller can recover from by fixing the request
    pub fn is_caller_error(&self) -> bool {
        matches!(self, BusError::UnknownTenant { .. } | BusError::Serialization(_))
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::transport(err)
    }
}
