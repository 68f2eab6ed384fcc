//! TenantBus Dispatcher
//!
//! Connects to every configured tenant virtual host and exposes the HTTP API
//! for dispatching commands and events to exactly one tenant.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TB_CONFIG` | `tenantbus.toml` | Path to the TOML configuration |
//! | `TB_API_PORT` | from config | API server port |
//! | `TB_SERVICE_NAME` | from config | Process identity used in queue names |
//! | `RUST_LOG` | `info` | Log level |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tb_api::{create_router, AppState};
use tb_bus::amqp::AmqpClientFactory;
use tb_bus::{BusPublisher, TenantClientPool};
use tb_config::AppConfig;

/// TenantBus Dispatcher
#[derive(Parser, Debug)]
#[command(name = "tb-dispatcher")]
#[command(about = "Dispatches commands and events to a single tenant's broker")]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "TB_CONFIG", default_value = "tenantbus.toml")]
    config: PathBuf,

    /// API server port, overrides `service.api_port`
    #[arg(long, env = "TB_API_PORT")]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    info!("Starting TenantBus Dispatcher");

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let api_port = args.api_port.unwrap_or(config.service.api_port);

    // 1. Metrics recorder
    let metrics_handle = if config.service.metrics_enabled {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("installing Prometheus recorder")?,
        )
    } else {
        None
    };

    // 2. One client per tenant
    let pool = TenantClientPool::build(&config.tenants, &config.service.name, &AmqpClientFactory)
        .await
        .context("connecting tenant clients")?;
    let pool = Arc::new(pool);
    let publisher = BusPublisher::new(pool.clone());

    // 3. API server
    let mut state = AppState::new(publisher);
    if let Some(handle) = metrics_handle {
        state = state.with_metrics(handle);
    }
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let api_addr = format!("0.0.0.0:{}", api_port);
    let listener = TcpListener::bind(&api_addr).await?;
    info!("API server listening on http://{}", api_addr);
    info!(
        service = %config.service.name,
        tenants = config.tenants.len(),
        "TenantBus Dispatcher started"
    );
    info!("Press Ctrl+C to shutdown");

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    match server.await {
        Ok(Ok(())) => info!("API server stopped"),
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    pool.close_all().await;

    info!("TenantBus Dispatcher shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received...");
}
