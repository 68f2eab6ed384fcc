//! TenantClientPool - one broker client per configured tenant
//!
//! Built once at startup and read-only afterwards, so concurrent `resolve`
//! calls need no locking. Each handle records the tenant id it was built
//! for; the id is never recovered from the client itself.

use std::collections::HashMap;
use std::sync::Arc;

use tb_common::TenantConfig;
use tracing::{debug, info, warn};

use crate::client::{BusClient, ClientFactory};
use crate::error::BusError;
use crate::naming::NamingConventions;
use crate::Result;

/// A tenant's client together with the identity it was built from
#[derive(Clone)]
pub struct TenantClientHandle {
    tenant_id: String,
    conventions: NamingConventions,
    client: Arc<dyn BusClient>,
}

impl TenantClientHandle {
    pub fn new(
        tenant_id: impl Into<String>,
        conventions: NamingConventions,
        client: Arc<dyn BusClient>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            conventions,
            client,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn namespace(&self) -> &str {
        self.conventions.namespace()
    }

    pub fn conventions(&self) -> &NamingConventions {
        &self.conventions
    }

    pub fn client(&self) -> &Arc<dyn BusClient> {
        &self.client
    }
}

impl std::fmt::Debug for TenantClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantClientHandle")
            .field("tenant_id", &self.tenant_id)
            .field("namespace", &self.conventions.namespace())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct TenantClientPool {
    /// Handles in configuration order
    handles: Vec<TenantClientHandle>,
    /// Tenant id -> position in `handles`
    index: HashMap<String, usize>,
}

impl TenantClientPool {
    /// Create one client per tenant through `factory`.
    ///
    /// Duplicate tenant ids are rejected before any client is created.
    pub async fn build(
        tenants: &[TenantConfig],
        process_identity: &str,
        factory: &dyn ClientFactory,
    ) -> Result<Self> {
        check_unique(tenants.iter().map(|t| t.tenant_id()))?;

        let mut handles = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let conventions = NamingConventions::new(tenant.namespace.clone(), process_identity);
            let client = factory.create_client(tenant, &conventions).await?;

            info!(
                tenant_id = %tenant.tenant_id(),
                namespace = %tenant.namespace,
                "Created tenant client"
            );
            handles.push(TenantClientHandle::new(tenant.tenant_id(), conventions, client));
        }

        let pool = Self::from_handles(handles)?;
        info!(tenants = pool.len(), "Tenant client pool ready");
        Ok(pool)
    }

    /// Assemble a pool from already-built handles
    pub fn from_handles(handles: Vec<TenantClientHandle>) -> Result<Self> {
        check_unique(handles.iter().map(|h| h.tenant_id()))?;

        let index = handles
            .iter()
            .enumerate()
            .map(|(i, h)| (h.tenant_id.clone(), i))
            .collect();

        Ok(Self { handles, index })
    }

    /// Look up the handle built for `tenant_id`. Pure lookup, no I/O.
    pub fn resolve(&self, tenant_id: &str) -> Result<&TenantClientHandle> {
        if tenant_id.trim().is_empty() {
            return Err(BusError::unknown_tenant(tenant_id));
        }

        match self.index.get(tenant_id) {
            Some(&i) => {
                debug!(tenant_id = %tenant_id, "Resolved tenant client");
                Ok(&self.handles[i])
            }
            None => Err(BusError::unknown_tenant(tenant_id)),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Tenant ids in configuration order
    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|h| h.tenant_id())
    }

    pub fn handles(&self) -> &[TenantClientHandle] {
        &self.handles
    }

    /// Close every tenant client. Failures are logged and do not stop the others.
    ///
    /// Returns the number of clients that closed cleanly.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for handle in &self.handles {
            match handle.client().close().await {
                Ok(()) => {
                    debug!(tenant_id = %handle.tenant_id(), "Tenant client closed");
                    closed += 1;
                }
                Err(e) => {
                    warn!(tenant_id = %handle.tenant_id(), error = %e, "Failed to close tenant client");
                }
            }
        }
        info!(closed = closed, tenants = self.len(), "Tenant client pool closed");
        closed
    }
}

fn check_unique<'a>(ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(BusError::ambiguous_tenant(id));
        }
    }
    Ok(())
}
