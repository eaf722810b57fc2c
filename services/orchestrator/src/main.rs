//! Fleet Orchestrator
//!
//! Launches the agents declared in the fleet file wave by wave, prints a
//! launch report, then monitors and recovers them until Ctrl-C.
//!
//! Exit code: 0 if every required agent was healthy after launch, 1
//! otherwise. A launch that stalls on a wave leaves already-started agents
//! running.

use std::process::ExitCode;

use anyhow::Result;
use fleet_orchestrator::config::Config;
use fleet_orchestrator::{Orchestrator, OrchestratorError};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host = %config.host,
        spec_path = %config.spec_path,
        central_url = %config.central_url,
        "Starting fleet orchestrator"
    );

    // Graph errors are fatal: never run a partially resolved fleet
    let orchestrator = match Orchestrator::from_config(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "Failed to load fleet");
            eprintln!("error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut tasks = orchestrator.start();

    let launch = tokio::select! {
        result = orchestrator.launch() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal during launch");
            orchestrator.cancel();
            Err(OrchestratorError::from(
                fleet_orchestrator::SupervisorError::Cancelled {
                    completed_waves: orchestrator.supervisor().completed_waves(),
                },
            ))
        }
    };

    let report = orchestrator.report().await;
    println!("{}", report);

    if let Err(e) = launch {
        // Started agents keep running; only the orchestrator exits.
        warn!(error = %e, kind = ?e.kind(), "Launch did not complete");
        eprintln!("error: {}", e);
        orchestrator.shutdown(tasks, false).await;
        return Ok(ExitCode::FAILURE);
    }
    let code = report.exit_code();

    orchestrator.start_monitoring(&mut tasks);
    info!("Fleet launched, monitoring");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");
    orchestrator.shutdown(tasks, true).await;

    println!("{}", orchestrator.report().await);
    info!("Fleet orchestrator shutdown complete");
    Ok(ExitCode::from(code))
}
