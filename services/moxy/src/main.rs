//! moxy
//!
//! TCP port-forwarding proxy.
//!
//! This service:
//! - Reads its routes from the environment (MOXY_ROUTES)
//! - Binds every local port, failing fast if any cannot be bound
//! - Relays each accepted connection to the route's remote address
//! - Tears everything down on Ctrl+C

use std::sync::Arc;

use anyhow::Result;
use moxy::{Config, LoggingObserver, ProxyServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MOXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting moxy");
    info!(
        bind_ip = %config.settings.bind_ip,
        route_count = config.routes.len(),
        relay_buffer_size = config.settings.relay_buffer_size,
        "Configuration loaded"
    );

    let server = ProxyServer::with_settings(config.settings.clone());
    server.add_listener(Arc::new(LoggingObserver));

    for route in &config.routes {
        server
            .listen_on(route.local_port)
            .connect_to(route.remote.clone())
            .await?;
    }

    if let Err(e) = server.start().await {
        error!(error = %e, "Failed to start proxy server");
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    server.stop().await;
    info!("moxy shutdown complete");
    Ok(())
}
