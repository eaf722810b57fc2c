//! Fleet Central Hub
//!
//! Aggregates health records forwarded by every host's edge hub, raises
//! cross-host alerts and authorizes fleet-wide restarts.

use std::sync::Arc;

use anyhow::Result;
use fleet_hub::{alerts::AlertWorker, api, central::CentralHub, config, state::AppState};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_HUB_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet central hub");
    info!(
        listen_addr = %config.listen_addr,
        expected_hosts = config.expected_hosts.len(),
        edge_grace_secs = config.edge_grace.as_secs(),
        "Configuration loaded"
    );

    let hub = Arc::new(CentralHub::new(config.central()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let alert_worker = AlertWorker::new(Arc::clone(&hub), config.alert_interval);
    let alert_handle = tokio::spawn(alert_worker.run(shutdown_rx.clone()));

    let app = api::create_router(AppState::new(hub));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(std::time::Duration::from_secs(10), alert_handle)
        .await
        .is_err()
    {
        warn!("Alert worker did not shut down in time");
    }

    info!("Central hub shutdown complete");
    Ok(())
}
