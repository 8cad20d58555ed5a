//! portmux
//!
//! Transparent multi-service TCP proxy behind one socket.
//!
//! This service:
//! - Loads the Apps document (service name, ports, targets)
//! - Binds one loopback socket and registers it, with every configured
//!   port, with the kernel steering layer
//! - Recovers each connection's original port and forwards it to the next
//!   backend of the owning service
//! - Stops accepting on SIGINT; open sessions drain on their own deadlines

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portmux::{
    AppsConfig, Config, FileSteering, LogSteering, ProxyServer, RoutingTable, ServerConfig,
    SessionConfig, Steering,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portmux");
    info!(
        apps_path = %config.apps_path.display(),
        proxy_port = config.proxy_port,
        session_timeout_ms = config.session_timeout.as_millis() as u64,
        max_retries = config.max_retries,
        recovery = ?config.recovery,
        "Configuration loaded"
    );

    // Configuration problems are fatal before any socket is opened
    let apps = AppsConfig::load(&config.apps_path)
        .with_context(|| format!("Failed to load {}", config.apps_path.display()))?;
    let routing = Arc::new(RoutingTable::from_apps(&apps.apps).context("Invalid routing table")?);

    let server_config = ServerConfig {
        port: config.proxy_port,
        session: SessionConfig {
            timeout: config.session_timeout,
            max_retries: config.max_retries,
            recovery: config.recovery,
        },
        connect_timeout: config.connect_timeout,
    };
    let server = ProxyServer::bind(server_config, routing)
        .await
        .context("Failed to bind proxy socket")?;

    let steering: Box<dyn Steering> = match &config.steering_file {
        Some(path) => Box::new(FileSteering::new(path.clone())),
        None => Box::new(LogSteering),
    };
    steering
        .register(&server.steering_registration())
        .context("Failed to register with steering layer")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut proxy_handle = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut proxy_handle => {
            match result {
                Ok(Ok(())) => info!("Proxy exited"),
                Ok(Err(e)) => error!(error = %e, "Proxy error"),
                Err(e) => error!(error = %e, "Proxy task panicked"),
            }
            return Ok(());
        }
    }

    // Stop accepting; running sessions finish on their own
    let _ = shutdown_tx.send(true);

    match proxy_handle.await {
        Ok(Ok(())) => info!("Proxy shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Proxy error during shutdown"),
        Err(e) => error!(error = %e, "Proxy task panicked"),
    }

    Ok(())
}
