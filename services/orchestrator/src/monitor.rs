//! Steady-state health monitoring.
//!
//! One task per agent probes on its own interval. Each probe result flows
//! through the supervisor (state update), the error bus (warnings and
//! regressions), the edge hub (a hub record) and finally the recovery
//! engine, whose decision is handed back to the supervisor.
//!
//! A separate task listens on the error bus and turns serious events about
//! an agent into an early probe. Early probe requests are coalesced: at
//! most one is pending per agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_events::{
    AgentStatus, ErrorEvent, FleetErrorKind, HealthProbeResult, HubRecord, ProbeClassification,
    Severity,
};
use futures_util::future::join_all;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::bus::{ErrorBus, EventFilter};
use crate::edge::EdgeHub;
use crate::recovery::{RecoveryAction, RecoveryEngine};
use crate::state::StatusChange;
use crate::supervisor::Supervisor;

/// Drives probes and feeds their results to recovery.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    engine: Arc<RecoveryEngine>,
    edge: Arc<EdgeHub>,
    bus: ErrorBus,
    interval: Duration,
    reprobes: Mutex<HashMap<String, Arc<Notify>>>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<Supervisor>,
        engine: Arc<RecoveryEngine>,
        edge: Arc<EdgeHub>,
        bus: ErrorBus,
        interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            engine,
            edge,
            bus,
            interval,
            reprobes: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor every agent until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let agents: Vec<String> = self
            .supervisor
            .graph()
            .specs()
            .map(|s| s.name.clone())
            .collect();
        info!(
            agents = agents.len(),
            interval_secs = self.interval.as_secs(),
            "Starting health monitor"
        );

        let mut tasks: Vec<_> = agents
            .into_iter()
            .map(|name| tokio::spawn(Arc::clone(&self).watch_agent(name, shutdown.clone())))
            .collect();
        tasks.push(tokio::spawn(Arc::clone(&self).watch_errors(shutdown.clone())));

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "Monitor task panicked");
            }
        }
        info!("Health monitor stopped");
    }

    /// Probe `name` once and act on the result.
    ///
    /// Returns `None` if the agent is not being monitored right now
    /// (starting, stopped, failed or unknown).
    pub async fn check_agent(self: &Arc<Self>, name: &str) -> Option<RecoveryAction> {
        let (result, change) = self.supervisor.probe_agent(name).await?;
        self.publish_probe_events(&result, change.as_ref());

        let status = match &change {
            Some(change) => change.current,
            None => self
                .supervisor
                .table()
                .status(name)
                .await
                .unwrap_or(AgentStatus::Unreachable),
        };
        self.edge
            .record(HubRecord::from_probe(self.edge.host(), &result, status));

        let action = self.engine.on_probe_result(&result).await;
        self.dispatch(action.clone());
        Some(action)
    }

    /// Ask for an out-of-cadence probe of `agent`.
    pub fn request_reprobe(&self, agent: &str) {
        self.notifier(agent).notify_one();
    }

    fn dispatch(self: &Arc<Self>, action: RecoveryAction) {
        match action {
            RecoveryAction::None => {}
            RecoveryAction::Reprobe { agent, after } if after.is_zero() => {
                self.request_reprobe(&agent);
            }
            RecoveryAction::Reprobe { agent, after } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    this.request_reprobe(&agent);
                });
            }
            action => {
                let supervisor = Arc::clone(&self.supervisor);
                tokio::spawn(async move {
                    if let Err(e) = supervisor.execute(action).await {
                        error!(error = %e, "Recovery action failed");
                    }
                });
            }
        }
    }

    fn publish_probe_events(&self, result: &HealthProbeResult, change: Option<&StatusChange>) {
        let kind = match result.classification {
            ProbeClassification::Healthy => return,
            ProbeClassification::Unhealthy => FleetErrorKind::HealthyButDegraded,
            ProbeClassification::Timeout => FleetErrorKind::ProbeTimeout,
            ProbeClassification::TransportFailure => FleetErrorKind::ProbeTransportFailure,
        };

        let regression = change.filter(|c| c.is_regression());
        let severity = if regression.is_some() {
            Severity::Error
        } else {
            Severity::Warning
        };
        let message = match regression {
            Some(c) => format!("regressed from {} to {}", c.previous, c.current),
            None => format!("health probe failed: {}", result.classification),
        };

        let mut event = ErrorEvent::new(severity, &result.agent_name, message)
            .with_kind(kind)
            .with_context("latency_ms", result.latency_ms());
        if let Some(detail) = &result.detail {
            event = event.with_context("detail", detail);
        }
        self.bus.publish(event);
    }

    async fn watch_agent(self: Arc<Self>, name: String, mut shutdown: watch::Receiver<bool>) {
        let notify = self.notifier(&name);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; agents were just probed at launch.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = notify.notified() => {
                    debug!(agent = %name, "Early probe requested");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.check_agent(&name).await;
        }
        debug!(agent = %name, "Agent monitor stopped");
    }

    async fn watch_errors(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.bus.subscribe(EventFilter::min_severity(Severity::Error));
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Error bus closed");
                        break;
                    };
                    let action = self.engine.on_error_event(&event).await;
                    self.dispatch(action);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn notifier(&self, agent: &str) -> Arc<Notify> {
        let mut reprobes = self.reprobes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(reprobes.entry(agent.to_string()).or_default())
    }
}
