//! Fleet wiring.
//!
//! Builds every component from the configuration and the fleet file, and
//! sequences a run: launch, monitor until shutdown, stop.

use std::sync::Arc;

use fleet_events::FleetErrorKind;
use fleet_graph::{DependencyGraph, GraphError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::ErrorBus;
use crate::client::CentralClient;
use crate::config::Config;
use crate::edge::{EdgeConfig, EdgeHub, HubTransport};
use crate::fleet::{FleetFile, SpecError};
use crate::health::{HealthCheckClient, HealthProbe};
use crate::monitor::HealthMonitor;
use crate::recovery::RecoveryEngine;
use crate::report::LaunchReport;
use crate::runtime::{CommandLauncher, ProcessLauncher};
use crate::state::StateTable;
use crate::supervisor::{LaunchSummary, Supervisor, SupervisorConfig, SupervisorError};

/// Operator-facing orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("failed to set up central hub client: {0}")]
    Client(String),
}

impl OrchestratorError {
    /// Taxonomy kind of this error, where it has one.
    pub fn kind(&self) -> Option<FleetErrorKind> {
        match self {
            Self::Graph(GraphError::UnknownDependency { .. }) => {
                Some(FleetErrorKind::UnknownDependency)
            }
            Self::Graph(GraphError::CyclicDependency { .. }) => {
                Some(FleetErrorKind::CyclicDependency)
            }
            Self::Supervisor(
                SupervisorError::WaveTimeout { .. } | SupervisorError::Launch { .. },
            ) => Some(FleetErrorKind::WaveTimeout),
            _ => None,
        }
    }
}

/// Handles of the background tasks started by [`Orchestrator::start`].
pub struct BackgroundTasks {
    edge: JoinHandle<()>,
    monitor: Option<JoinHandle<()>>,
}

/// A fully wired orchestrator.
pub struct Orchestrator {
    graph: Arc<DependencyGraph>,
    table: Arc<StateTable>,
    bus: ErrorBus,
    supervisor: Arc<Supervisor>,
    edge: Arc<EdgeHub>,
    monitor: Arc<HealthMonitor>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    /// Wire real processes, TCP health probes and the HTTP Central client.
    pub fn from_config(config: &Config) -> Result<Self, OrchestratorError> {
        let fleet = FleetFile::load(&config.spec_path)?;
        let transport =
            CentralClient::new(config).map_err(|e| OrchestratorError::Client(format!("{:#}", e)))?;
        let prober = HealthCheckClient::new(config.probe_timeout(), config.healthy_tokens.clone());
        Self::new(
            config,
            fleet,
            Arc::new(CommandLauncher::new()),
            Arc::new(prober),
            Arc::new(transport),
        )
    }

    pub fn new(
        config: &Config,
        fleet: FleetFile,
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn HealthProbe>,
        transport: Arc<dyn HubTransport>,
    ) -> Result<Self, OrchestratorError> {
        let graph = Arc::new(DependencyGraph::build(&fleet.agents)?);
        info!(
            agents = fleet.agents.len(),
            waves = graph.waves().len(),
            "Dependency graph resolved"
        );

        let table = Arc::new(StateTable::new());
        let bus = ErrorBus::new(config.bus_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&graph),
            launcher,
            prober,
            Arc::clone(&table),
            bus.clone(),
            SupervisorConfig::from(config),
            shutdown_rx,
        ));
        let edge = Arc::new(EdgeHub::new(EdgeConfig::from(config), transport, bus.clone()));
        let engine = Arc::new(RecoveryEngine::new(
            Arc::clone(&graph),
            fleet.policies,
            Arc::clone(&table),
            edge.clone(),
            bus.clone(),
            config.host.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&supervisor),
            engine,
            Arc::clone(&edge),
            bus.clone(),
            config.probe_interval(),
        ));

        Ok(Self {
            graph,
            table,
            bus,
            supervisor,
            edge,
            monitor,
            shutdown,
        })
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    pub fn bus(&self) -> &ErrorBus {
        &self.bus
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn edge(&self) -> &Arc<EdgeHub> {
        &self.edge
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Signal every component to wind down. Cancels a launch in progress.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Start the edge hub's forwarding loop.
    pub fn start(&self) -> BackgroundTasks {
        let edge = tokio::spawn(Arc::clone(&self.edge).run(self.shutdown.subscribe()));
        BackgroundTasks { edge, monitor: None }
    }

    /// Launch the fleet wave by wave.
    pub async fn launch(&self) -> Result<LaunchSummary, OrchestratorError> {
        self.supervisor.launch_all().await.map_err(|e| {
            error!(error = %e, "Launch failed");
            OrchestratorError::from(e)
        })
    }

    /// Start steady-state monitoring.
    pub fn start_monitoring(&self, tasks: &mut BackgroundTasks) {
        if tasks.monitor.is_none() {
            tasks.monitor = Some(tokio::spawn(
                Arc::clone(&self.monitor).run(self.shutdown.subscribe()),
            ));
        }
    }

    /// Current report over every declared agent.
    pub async fn report(&self) -> LaunchReport {
        LaunchReport::collect(&self.graph, &self.table).await
    }

    /// Stop background tasks, optionally stopping every agent as well.
    pub async fn shutdown(&self, tasks: BackgroundTasks, stop_agents: bool) {
        self.cancel();
        if let Some(monitor) = tasks.monitor {
            if let Err(e) = monitor.await {
                error!(error = %e, "Monitor task panicked");
            }
        }
        if stop_agents {
            self.supervisor.stop_all().await;
        }
        if let Err(e) = tasks.edge.await {
            error!(error = %e, "Edge hub task panicked");
        }
        info!(stop_agents, "Orchestrator shut down");
    }
}
