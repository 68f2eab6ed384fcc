//! TenantBus Configuration
//!
//! Loads the service settings and the ordered tenant list from a TOML file:
//!
//! ```toml
//! [service]
//! name = "orders-service"
//! api_port = 8080
//!
//! [[tenants]]
//! virtual_host = "acme"
//! namespace = "acme"
//! hostnames = ["rabbit-1"]
//! ```
//!
//! Environment overrides: `TB_SERVICE_NAME`, `TB_API_PORT`.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tb_common::TenantConfig;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Duplicate tenant: {virtual_host}")]
    DuplicateTenant { virtual_host: String },
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Process identity; prefixes every queue name this service declares
    pub name: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_api_port() -> u16 { 8080 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl AppConfig {
    /// Read, override from the environment, and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            service = %config.service.name,
            tenants = config.tenants.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("TB_SERVICE_NAME") {
            debug!(name = %name, "Overriding service name from environment");
            self.service.name = name;
        }
        if let Some(port) = std::env::var("TB_API_PORT").ok().and_then(|v| v.parse().ok()) {
            self.service.api_port = port;
        }
    }

    /// Reject configurations the tenant pool would refuse at startup
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::invalid("service.name must not be empty"));
        }
        if self.tenants.is_empty() {
            return Err(ConfigError::invalid("at least one [[tenants]] entry is required"));
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.virtual_host.trim().is_empty() {
                return Err(ConfigError::invalid("tenant virtual_host must not be empty"));
            }
            if tenant.connection.hostnames.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "tenant {} has no hostnames",
                    tenant.virtual_host
                )));
            }
            if !seen.insert(tenant.virtual_host.as_str()) {
                return Err(ConfigError::DuplicateTenant {
                    virtual_host: tenant.virtual_host.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn tenant(&self, virtual_host: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.virtual_host == virtual_host)
    }
}
