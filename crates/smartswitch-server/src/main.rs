//! # smartswitch-server
//!
//! Daemon that keeps a BLE smart switch awake.
//!
//! This binary provides:
//! - The background keep-alive loop (optionally auto-started from config)
//! - REST API to start, stop and inspect the loop
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, against a simulated switch
//! cargo run --package smartswitch-server --no-default-features --features mock-bluetooth
//!
//! # Production
//! SMARTSWITCH__SERVER__PRODUCTION=true ./smartswitch-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use anyhow::Context;
use smartswitch_core::{KeepAliveHost, SmartSwitchConfig, TracingIndicator, Transport};
use smartswitch_server::{api, logging, state::AppState};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SmartSwitchConfig::load().context("Failed to load configuration")?;

    logging::init(config.server.production)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting smartswitch-server");

    let transport = build_transport(&config).await?;
    let host = Arc::new(KeepAliveHost::new(
        transport,
        config.lease.build(),
        Arc::new(TracingIndicator),
        config.loop_config(),
        config.notification.clone(),
    ));

    if let Some(address) = config.target_address()? {
        info!(address = %address, "Auto-starting keep-alive from configuration");
        if let Err(e) = host.start(address).await {
            error!(error = %e, "Auto-start failed; waiting for a start request");
        }
    }

    let app = api::create_router(AppState::new(Arc::clone(&host)));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    host.shutdown().await;
    info!("smartswitch-server stopped");

    Ok(())
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn build_transport(config: &SmartSwitchConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = smartswitch_core::BluezTransport::new(config.bluetooth.adapter.as_deref())
        .await
        .map_err(smartswitch_core::SmartSwitchError::from)?;
    Ok(Arc::new(transport))
}

#[cfg(any(feature = "mock-bluetooth", not(feature = "bluetooth")))]
#[allow(clippy::unused_async)]
async fn build_transport(_config: &SmartSwitchConfig) -> anyhow::Result<Arc<dyn Transport>> {
    tracing::warn!("Using simulated Bluetooth transport");
    Ok(Arc::new(smartswitch_core::MockTransport::new()))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Cannot install signal handlers, falling back to Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "Ctrl+C handler failed");
                    }
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler failed");
        }
        info!("Received Ctrl+C, initiating shutdown...");
    }
}
