use std::sync::Arc;

use async_trait::async_trait;
use tb_common::TenantConfig;

use crate::message::OutboundMessage;
use crate::naming::NamingConventions;
use crate::Result;

/// A live connection to one tenant's virtual host.
///
/// Implementations must tolerate concurrent `publish` calls.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Write the message to the broker and wait for the broker to accept it
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Whether the underlying connection is currently usable
    fn is_healthy(&self) -> bool {
        true
    }

    /// Release the connection; called once at shutdown
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds one client per tenant at startup
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create_client(
        &self,
        tenant: &TenantConfig,
        conventions: &NamingConventions,
    ) -> Result<Arc<dyn BusClient>>;
}
