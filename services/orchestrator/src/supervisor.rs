//! Process supervisor.
//!
//! Launches agents wave by wave, waits for each wave's required members to
//! report healthy, and carries out the recovery engine's restart decisions.
//! The supervisor owns every process handle; nothing else spawns or
//! terminates agent processes.
//!
//! A wave is launched concurrently. Members with `required = false` are
//! spawned with the rest but never hold the wave back: they stop waiting
//! as soon as the required members have settled. If a required member is not
//! healthy before the wave timeout, the remaining waves are not launched
//! and already-started agents are left running.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use fleet_events::{
    AgentSpec, AgentStatus, ErrorEvent, FleetErrorKind, HealthProbeResult, ProbeClassification,
    Severity,
};
use fleet_graph::{DependencyGraph, LaunchWaves};
use fleet_id::BootId;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::ErrorBus;
use crate::config::Config;
use crate::health::HealthProbe;
use crate::recovery::RecoveryAction;
use crate::runtime::{ProcessHandle, ProcessLauncher};
use crate::state::{InvalidTransition, ProbeSummary, StateTable, StatusChange};

/// Component name used as the source of supervisor events.
pub const SUPERVISOR_SOURCE: &str = "supervisor";

/// Supervisor timing.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time a wave's required members have to become healthy.
    pub wave_timeout: Duration,
    /// Probe interval while an agent is starting.
    pub startup_probe_interval: Duration,
    /// Time an agent gets to exit after SIGTERM.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            wave_timeout: Duration::from_secs(60),
            startup_probe_interval: Duration::from_millis(500),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            wave_timeout: config.wave_timeout(),
            startup_probe_interval: config.startup_probe_interval(),
            ..Default::default()
        }
    }
}

/// Why a required agent held its wave back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    TimedOut,
    Exited { code: i32 },
    SpawnFailed { error: String },
    Cancelled,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::TimedOut => write!(f, "not healthy before the wave timeout"),
            BlockReason::Exited { code } => write!(f, "process exited with code {}", code),
            BlockReason::SpawnFailed { error } => write!(f, "failed to start: {}", error),
            BlockReason::Cancelled => write!(f, "launch cancelled"),
        }
    }
}

/// A required agent that did not become healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedAgent {
    pub agent: String,
    pub reason: BlockReason,
    /// Probe outcomes of the failed launch, oldest first.
    pub probe_history: Vec<ProbeSummary>,
}

impl std::fmt::Display for BlockedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}", self.agent, self.reason)?;
        if !self.probe_history.is_empty() {
            let probes: Vec<String> = self.probe_history.iter().map(ToString::to_string).collect();
            write!(f, "; probes: {}", probes.join(", "))?;
        }
        write!(f, ")")
    }
}

fn describe(blocked: &[BlockedAgent]) -> String {
    blocked
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("wave {wave} timed out: {}", describe(.blocked))]
    WaveTimeout { wave: usize, blocked: Vec<BlockedAgent> },

    #[error("wave {wave} could not be launched: {}", describe(.blocked))]
    Launch { wave: usize, blocked: Vec<BlockedAgent> },

    #[error("launch cancelled after {completed_waves} completed wave(s)")]
    Cancelled { completed_waves: usize },

    #[error("launch halted for a fleet-wide restart after {completed_waves} completed wave(s)")]
    Halted { completed_waves: usize },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl SupervisorError {
    /// Agents that blocked a wave, if this is a wave failure.
    pub fn blocked(&self) -> &[BlockedAgent] {
        match self {
            Self::WaveTimeout { blocked, .. } | Self::Launch { blocked, .. } => blocked,
            _ => &[],
        }
    }
}

/// Outcome of one launch wave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveResult {
    pub index: usize,
    /// Required members that became healthy.
    pub healthy: Vec<String>,
    /// Required members that did not.
    pub blocked: Vec<BlockedAgent>,
    /// Optional members, launched alongside but never waited on past the
    /// required members.
    pub optional: Vec<String>,
}

impl WaveResult {
    /// Every required member became healthy.
    pub fn is_satisfied(&self) -> bool {
        self.blocked.is_empty()
    }

    fn was_cancelled(&self) -> bool {
        !self.blocked.is_empty()
            && self
                .blocked
                .iter()
                .all(|b| b.reason == BlockReason::Cancelled)
    }

    fn into_error(self) -> SupervisorError {
        let spawn_failed = self
            .blocked
            .iter()
            .any(|b| matches!(b.reason, BlockReason::SpawnFailed { .. }));
        if spawn_failed {
            SupervisorError::Launch {
                wave: self.index,
                blocked: self.blocked,
            }
        } else {
            SupervisorError::WaveTimeout {
                wave: self.index,
                blocked: self.blocked,
            }
        }
    }
}

/// Outcome of a full launch sequence.
#[derive(Debug, Clone, Default)]
pub struct LaunchSummary {
    pub waves: Vec<WaveResult>,
}

#[derive(Debug)]
enum MemberOutcome {
    Healthy,
    /// An optional member still not healthy when its wave settled.
    Pending,
    Blocked(BlockReason),
}

/// How a caller may proceed with starting an agent.
enum StartClaim {
    /// The caller moved the agent to STARTING and must launch it.
    Owned,
    /// Someone else is already starting it.
    InProgress,
    /// Already healthy; nothing to do.
    Healthy,
}

/// Removes its key from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a StdMutex<HashSet<String>>, key: String) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.clone()).then(|| Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}

/// Resolves once `rx` reads true. Never resolves if the sender is gone.
async fn signalled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Like [`signalled`], for an optional signal. `None` never resolves.
async fn released(release: Option<watch::Receiver<bool>>) {
    match release {
        Some(rx) => signalled(rx).await,
        None => std::future::pending().await,
    }
}

/// Owns agent processes and their lifecycle.
pub struct Supervisor {
    graph: Arc<DependencyGraph>,
    launcher: Arc<dyn ProcessLauncher>,
    prober: Arc<dyn HealthProbe>,
    table: Arc<StateTable>,
    bus: ErrorBus,
    config: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
    handles: Mutex<HashMap<String, ProcessHandle>>,
    in_flight: StdMutex<HashSet<String>>,
    completed_waves: AtomicUsize,
    halted: AtomicBool,
}

impl Supervisor {
    pub fn new(
        graph: Arc<DependencyGraph>,
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn HealthProbe>,
        table: Arc<StateTable>,
        bus: ErrorBus,
        config: SupervisorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            graph,
            launcher,
            prober,
            table,
            bus,
            config,
            shutdown,
            handles: Mutex::new(HashMap::new()),
            in_flight: StdMutex::new(HashSet::new()),
            completed_waves: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
        }
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    /// Waves fully launched so far: the boundary a fleet-wide restart
    /// relaunches up to.
    pub fn completed_waves(&self) -> usize {
        self.completed_waves.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Launch every wave in order.
    ///
    /// Stops at the first wave with a blocked required member. Cancelling
    /// (via the shutdown channel) stops before the next wave and leaves
    /// running agents alone.
    pub async fn launch_all(self: &Arc<Self>) -> Result<LaunchSummary, SupervisorError> {
        let waves = self.graph.waves().clone();
        let mut summary = LaunchSummary::default();
        info!(
            waves = waves.len(),
            agents = waves.agent_count(),
            "Starting launch sequence"
        );

        for (index, wave) in waves.iter().enumerate() {
            let completed_waves = self.completed_waves();
            if self.is_shutting_down() {
                warn!(completed_waves, "Launch cancelled");
                return Err(SupervisorError::Cancelled { completed_waves });
            }
            if self.halted.load(Ordering::SeqCst) {
                warn!(completed_waves, "Launch halted");
                return Err(SupervisorError::Halted { completed_waves });
            }

            let result = self.launch_wave(index, wave).await;
            if result.was_cancelled() {
                return Err(SupervisorError::Cancelled { completed_waves });
            }
            if self.halted.load(Ordering::SeqCst) {
                warn!(completed_waves, "Launch halted");
                return Err(SupervisorError::Halted { completed_waves });
            }
            if !result.is_satisfied() {
                let err = result.into_error();
                error!(error = %err, "Launch sequence aborted");
                let agents: Vec<&str> = err.blocked().iter().map(|b| b.agent.as_str()).collect();
                self.bus.publish(
                    ErrorEvent::new(Severity::Critical, SUPERVISOR_SOURCE, err.to_string())
                        .with_kind(FleetErrorKind::WaveTimeout)
                        .with_context("wave", index)
                        .with_context("agents", agents.join(",")),
                );
                return Err(err);
            }

            self.completed_waves.store(index + 1, Ordering::SeqCst);
            summary.waves.push(result);
        }

        info!(waves = summary.waves.len(), "Launch sequence complete");
        Ok(summary)
    }

    /// Launch one wave and wait for its required members.
    pub async fn launch_wave(
        self: &Arc<Self>,
        index: usize,
        wave: &BTreeSet<String>,
    ) -> WaveResult {
        let deadline = Instant::now() + self.config.wave_timeout;
        info!(wave = index, agents = ?wave, "Launching wave");

        let (required, optional): (Vec<&String>, Vec<&String>) = wave
            .iter()
            .partition(|name| self.graph.spec(name).is_none_or(|s| s.required));
        let mut result = WaveResult {
            index,
            optional: optional.iter().map(|name| name.to_string()).collect(),
            ..Default::default()
        };

        let (settled_tx, settled_rx) = watch::channel(false);
        let required_launches = async {
            let outcomes = join_all(required.iter().map(|name| async move {
                (name.to_string(), self.launch_agent(name, deadline, None).await)
            }))
            .await;
            let _ = settled_tx.send(true);
            outcomes
        };
        let optional_launches = join_all(optional.iter().map(|name| {
            let release = Some(settled_rx.clone());
            async move {
                match self.launch_agent(name, deadline, release).await {
                    MemberOutcome::Healthy => {}
                    MemberOutcome::Pending => {
                        debug!(agent = %name, "Optional agent not healthy yet, wave proceeds");
                    }
                    MemberOutcome::Blocked(reason) => {
                        warn!(agent = %name, %reason, "Optional agent did not become healthy");
                    }
                }
            }
        }));
        let (outcomes, _) = tokio::join!(required_launches, optional_launches);

        for (agent, outcome) in outcomes {
            let reason = match outcome {
                MemberOutcome::Healthy => {
                    result.healthy.push(agent);
                    continue;
                }
                MemberOutcome::Pending => BlockReason::TimedOut,
                MemberOutcome::Blocked(reason) => reason,
            };
            let probe_history = self
                .table
                .snapshot(&agent)
                .await
                .map(|s| s.probes_since_boot())
                .unwrap_or_default();
            result.blocked.push(BlockedAgent {
                agent,
                reason,
                probe_history,
            });
        }

        if result.is_satisfied() {
            info!(wave = index, healthy = result.healthy.len(), "Wave healthy");
        }
        result
    }

    /// Start `name` and wait until it is healthy, the deadline passes, or
    /// `release` fires.
    async fn launch_agent(
        &self,
        name: &str,
        deadline: Instant,
        release: Option<watch::Receiver<bool>>,
    ) -> MemberOutcome {
        match self.claim_start(name).await {
            Ok(StartClaim::Owned) => self.spawn_and_wait(name, deadline, release).await,
            Ok(StartClaim::InProgress) => self.wait_until_healthy(name, deadline, release).await,
            Ok(StartClaim::Healthy) => MemberOutcome::Healthy,
            Err(error) => MemberOutcome::Blocked(BlockReason::SpawnFailed { error }),
        }
    }

    /// Move `name` to STARTING unless someone else already did.
    async fn claim_start(&self, name: &str) -> Result<StartClaim, String> {
        if self.graph.spec(name).is_none() {
            return Err(format!("unknown agent {}", name));
        }
        let entry = self.table.register(name).await;
        let mut state = entry.lock().await;
        match state.status {
            AgentStatus::Starting => Ok(StartClaim::InProgress),
            AgentStatus::Healthy if state.ever_started && state.pid.is_some() => {
                Ok(StartClaim::Healthy)
            }
            _ => state
                .transition(AgentStatus::Starting)
                .map(|_| StartClaim::Owned)
                .map_err(|e| e.to_string()),
        }
    }

    /// Spawn an agent already claimed as STARTING and probe it until healthy.
    async fn spawn_and_wait(
        &self,
        name: &str,
        deadline: Instant,
        release: Option<watch::Receiver<bool>>,
    ) -> MemberOutcome {
        let Some(spec) = self.graph.spec(name).cloned() else {
            return MemberOutcome::Blocked(BlockReason::SpawnFailed {
                error: format!("unknown agent {}", name),
            });
        };

        self.terminate_process(name).await;

        let boot_id = match self.launcher.spawn(&spec).await {
            Ok(handle) => {
                let boot_id = handle.boot_id;
                if let Some(entry) = self.table.entry(name).await {
                    entry.lock().await.begin_boot(boot_id, handle.pid);
                }
                self.handles.lock().await.insert(name.to_string(), handle);
                boot_id
            }
            Err(e) => {
                let error = format!("{:#}", e);
                error!(agent = %name, error = %error, "Failed to spawn agent");
                if let Some(entry) = self.table.entry(name).await {
                    let mut state = entry.lock().await;
                    state.last_error = Some(error.clone());
                    let _ = state.transition(AgentStatus::Failed);
                }
                self.bus.publish(
                    ErrorEvent::new(Severity::Error, name, format!("failed to start: {}", error))
                        .with_context("phase", "spawn"),
                );
                return MemberOutcome::Blocked(BlockReason::SpawnFailed { error });
            }
        };

        loop {
            let (result, _) = self.probe_instance(&spec, boot_id).await;
            if result.classification.is_healthy() {
                info!(agent = %name, boot_id = %boot_id, "Agent healthy");
                return MemberOutcome::Healthy;
            }
            if let Some(code) = self.table.snapshot(name).await.and_then(|s| s.exit_code) {
                return MemberOutcome::Blocked(BlockReason::Exited { code });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(agent = %name, "Agent not healthy before wave timeout");
                return MemberOutcome::Blocked(BlockReason::TimedOut);
            }
            let wait = self.config.startup_probe_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = signalled(self.shutdown.clone()) => {
                    return MemberOutcome::Blocked(BlockReason::Cancelled);
                }
                _ = released(release.clone()) => return MemberOutcome::Pending,
            }
        }
    }

    /// Wait for another task's launch of `name` to finish.
    async fn wait_until_healthy(
        &self,
        name: &str,
        deadline: Instant,
        release: Option<watch::Receiver<bool>>,
    ) -> MemberOutcome {
        loop {
            match self.table.status(name).await {
                Some(AgentStatus::Healthy) => return MemberOutcome::Healthy,
                Some(AgentStatus::Starting) => {}
                Some(other) => {
                    return MemberOutcome::Blocked(BlockReason::SpawnFailed {
                        error: format!("concurrent launch ended in {}", other),
                    })
                }
                None => {
                    return MemberOutcome::Blocked(BlockReason::SpawnFailed {
                        error: "agent was retired".to_string(),
                    })
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return MemberOutcome::Blocked(BlockReason::TimedOut);
            }
            let wait = self.config.startup_probe_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = signalled(self.shutdown.clone()) => {
                    return MemberOutcome::Blocked(BlockReason::Cancelled);
                }
                _ = released(release.clone()) => return MemberOutcome::Pending,
            }
        }
    }

    // =========================================================================
    // Probing
    // =========================================================================

    /// Probe a running agent for steady-state monitoring.
    ///
    /// Returns `None` for agents that are starting (the launch loop probes
    /// those), finished or unknown.
    pub async fn probe_agent(
        &self,
        name: &str,
    ) -> Option<(HealthProbeResult, Option<StatusChange>)> {
        let spec = self.graph.spec(name)?;
        let state = self.table.snapshot(name).await?;
        if !state.status.is_running() || state.status == AgentStatus::Starting {
            return None;
        }
        let boot_id = state.boot_id?;
        Some(self.probe_instance(spec, boot_id).await)
    }

    /// Probe one process instance and apply the result to its state.
    async fn probe_instance(
        &self,
        spec: &AgentSpec,
        boot_id: BootId,
    ) -> (HealthProbeResult, Option<StatusChange>) {
        let result = match self.poll_exit(&spec.name).await {
            Some(code) => {
                self.record_exit(&spec.name, code).await;
                HealthProbeResult::unreachable(
                    &spec.name,
                    ProbeClassification::TransportFailure,
                    Duration::ZERO,
                    format!("process exited with code {}", code),
                )
                .for_boot(Some(boot_id))
            }
            None => self.prober.probe(spec, Some(boot_id)).await,
        };
        let change = self.record_probe(&result).await;
        (result, change)
    }

    /// Apply a probe result to the agent's state.
    pub async fn record_probe(&self, result: &HealthProbeResult) -> Option<StatusChange> {
        let entry = self.table.entry(&result.agent_name).await?;
        let change = entry.lock().await.record_probe(result)?;
        if change.is_transition() {
            info!(
                agent = %change.agent,
                from = %change.previous,
                to = %change.current,
                "Agent status changed"
            );
        }
        Some(change)
    }

    async fn poll_exit(&self, name: &str) -> Option<i32> {
        let mut handles = self.handles.lock().await;
        let handle = handles.get_mut(name)?;
        self.launcher.exit_code(handle)
    }

    async fn record_exit(&self, name: &str, code: i32) {
        let Some(entry) = self.table.entry(name).await else {
            return;
        };
        let first_report = {
            let mut state = entry.lock().await;
            let first = state.exit_code.is_none();
            state.exit_code = Some(code);
            state.last_error = Some(format!("process exited with code {}", code));
            first
        };
        if first_report {
            warn!(agent = %name, code, "Agent process exited");
            self.bus.publish(
                ErrorEvent::new(Severity::Error, name, format!("process exited with code {}", code))
                    .with_kind(FleetErrorKind::ProbeTransportFailure)
                    .with_context("exit_code", code),
            );
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Carry out a recovery decision.
    pub async fn execute(self: &Arc<Self>, action: RecoveryAction) -> Result<(), SupervisorError> {
        match action {
            RecoveryAction::None | RecoveryAction::Reprobe { .. } => Ok(()),
            RecoveryAction::RestartProcess {
                agent,
                boot_id,
                delay,
                ..
            } => self.restart_agent(&agent, boot_id, delay).await,
            RecoveryAction::RestartGroup { group, delay, .. } => {
                self.restart_group(&group, delay).await
            }
            RecoveryAction::SystemWide { delay, .. } => self.restart_system(delay).await,
            RecoveryAction::Exhausted { agent, .. } => self.mark_failed(&agent).await,
        }
    }

    /// Restart one agent after `delay`.
    ///
    /// Does nothing if `boot_id` is given and the agent has been restarted
    /// since, or if the agent is already starting.
    pub async fn restart_agent(
        self: &Arc<Self>,
        name: &str,
        boot_id: Option<BootId>,
        delay: Duration,
    ) -> Result<(), SupervisorError> {
        if self.graph.spec(name).is_none() {
            return Err(SupervisorError::UnknownAgent(name.to_string()));
        }
        let Some(_guard) = InFlight::claim(&self.in_flight, format!("agent:{}", name)) else {
            debug!(agent = %name, "Restart already in flight");
            return Ok(());
        };
        if !self.sleep_unless_shutdown(delay).await {
            return Ok(());
        }

        let Some(state) = self.table.snapshot(name).await else {
            return Ok(());
        };
        if boot_id.is_some() && state.boot_id != boot_id {
            debug!(agent = %name, "Agent already restarted");
            return Ok(());
        }
        if !matches!(state.status, AgentStatus::Unhealthy | AgentStatus::Unreachable) {
            debug!(agent = %name, status = %state.status, "Skipping restart");
            return Ok(());
        }

        info!(agent = %name, delay_ms = delay.as_millis() as u64, "Restarting agent");
        let deadline = Instant::now() + self.config.wave_timeout;
        if let MemberOutcome::Blocked(reason) = self.launch_agent(name, deadline, None).await {
            warn!(agent = %name, %reason, "Restarted agent not healthy");
        }
        Ok(())
    }

    /// Restart every member of `group` after `delay`: stop in reverse
    /// dependency order, then relaunch in dependency order.
    pub async fn restart_group(
        self: &Arc<Self>,
        group: &str,
        delay: Duration,
    ) -> Result<(), SupervisorError> {
        let waves = self.graph.group_waves(group);
        if waves.is_empty() {
            return Err(SupervisorError::UnknownGroup(group.to_string()));
        }
        let Some(_guard) = InFlight::claim(&self.in_flight, format!("group:{}", group)) else {
            debug!(group, "Group restart already in flight");
            return Ok(());
        };
        if !self.sleep_unless_shutdown(delay).await {
            return Ok(());
        }

        warn!(group, agents = waves.agent_count(), "Restarting group");
        self.bus.publish(
            ErrorEvent::new(
                Severity::Warning,
                SUPERVISOR_SOURCE,
                format!("restarting group {}", group),
            )
            .with_context("group", group),
        );
        self.relaunch(&waves).await
    }

    /// Restart the fleet from the last completed wave boundary after `delay`.
    ///
    /// Halts the initial launch sequence if it is still running, relaunches
    /// every wave up to the boundary, then launches the waves past it.
    pub async fn restart_system(self: &Arc<Self>, delay: Duration) -> Result<(), SupervisorError> {
        let Some(_guard) = InFlight::claim(&self.in_flight, "system".to_string()) else {
            debug!("Fleet-wide restart already in flight");
            return Ok(());
        };
        self.halted.store(true, Ordering::SeqCst);
        let outcome = self.restart_fleet(delay).await;
        self.halted.store(false, Ordering::SeqCst);
        outcome
    }

    async fn restart_fleet(self: &Arc<Self>, delay: Duration) -> Result<(), SupervisorError> {
        if !self.sleep_unless_shutdown(delay).await {
            return Ok(());
        }

        let all = self.graph.waves().clone();
        let boundary = self.completed_waves();
        let waves = all.truncated(boundary);
        warn!(waves = boundary, agents = waves.agent_count(), "Restarting fleet");
        self.bus.publish(
            ErrorEvent::new(
                Severity::Error,
                SUPERVISOR_SOURCE,
                format!("fleet-wide restart of {} wave(s)", boundary),
            )
            .with_context("waves", boundary),
        );
        self.relaunch(&waves).await?;

        for (index, wave) in all.iter().enumerate().skip(boundary) {
            let completed_waves = self.completed_waves();
            if self.is_shutting_down() {
                return Err(SupervisorError::Cancelled { completed_waves });
            }
            let result = self.launch_wave(index, wave).await;
            if result.was_cancelled() {
                return Err(SupervisorError::Cancelled { completed_waves });
            }
            if !result.is_satisfied() {
                let err = result.into_error();
                error!(error = %err, "Fleet restart stopped");
                return Err(err);
            }
            self.completed_waves.fetch_max(index + 1, Ordering::SeqCst);
        }
        info!(waves = all.len(), "Fleet restart complete");
        Ok(())
    }

    /// Stop `waves` in reverse order, then launch them in order.
    async fn relaunch(self: &Arc<Self>, waves: &LaunchWaves) -> Result<(), SupervisorError> {
        let mut owned: BTreeSet<String> = BTreeSet::new();
        for wave in waves.iter().rev() {
            for name in wave.iter().rev() {
                if let Ok(StartClaim::Owned) = self.claim_start_for_restart(name).await {
                    self.terminate_process(name).await;
                    owned.insert(name.clone());
                }
            }
        }

        for (index, wave) in waves.iter().enumerate() {
            let deadline = Instant::now() + self.config.wave_timeout;
            let members: Vec<&String> = wave.iter().filter(|n| owned.contains(*n)).collect();
            let outcomes = join_all(members.iter().map(|name| async move {
                (name.to_string(), self.spawn_and_wait(name, deadline, None).await)
            }))
            .await;

            let mut blocked = Vec::new();
            for (agent, outcome) in outcomes {
                let required = self.graph.spec(&agent).is_none_or(|s| s.required);
                if let MemberOutcome::Blocked(reason) = outcome {
                    if required {
                        let probe_history = self
                            .table
                            .snapshot(&agent)
                            .await
                            .map(|s| s.probes_since_boot())
                            .unwrap_or_default();
                        blocked.push(BlockedAgent {
                            agent,
                            reason,
                            probe_history,
                        });
                    }
                }
            }

            if !blocked.is_empty() {
                // Members of later waves were never relaunched; hand them
                // back to steady-state monitoring as unreachable.
                for later in waves.iter().skip(index + 1) {
                    for name in later.iter().filter(|n| owned.contains(*n)) {
                        self.abandon_start(name, "restart aborted: dependency not healthy")
                            .await;
                    }
                }
                let err = WaveResult {
                    index,
                    blocked,
                    ..Default::default()
                }
                .into_error();
                error!(error = %err, "Relaunch aborted");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Like `claim_start`, but also takes over healthy agents.
    async fn claim_start_for_restart(&self, name: &str) -> Result<StartClaim, String> {
        let entry = self.table.entry(name).await.ok_or_else(|| "agent not live".to_string())?;
        let mut state = entry.lock().await;
        if state.status == AgentStatus::Starting {
            return Ok(StartClaim::InProgress);
        }
        state
            .transition(AgentStatus::Starting)
            .map(|_| StartClaim::Owned)
            .map_err(|e| e.to_string())
    }

    async fn abandon_start(&self, name: &str, reason: &str) {
        if let Some(entry) = self.table.entry(name).await {
            let mut state = entry.lock().await;
            state.last_error = Some(reason.to_string());
            let _ = state.transition(AgentStatus::Unreachable);
        }
    }

    /// Fail an agent whose retries are exhausted: kill it and retire its state.
    ///
    /// Refused, with the process left alone, if the agent is no longer in a
    /// state that can fail (it recovered or is being restarted).
    pub async fn mark_failed(&self, name: &str) -> Result<(), SupervisorError> {
        let Some(entry) = self.table.entry(name).await else {
            return Err(SupervisorError::UnknownAgent(name.to_string()));
        };
        {
            let mut state = entry.lock().await;
            if let Err(e) = state.transition(AgentStatus::Failed) {
                warn!(error = %e, "Not marking agent failed");
                return Err(e.into());
            }
            let exit = self.terminate_process(name).await;
            state.exit_code = state.exit_code.or(exit);
            state.pid = None;
        }
        self.table.retire(name).await;
        error!(agent = %name, "Agent failed, retries exhausted");
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Explicitly stop one agent and retire its state.
    pub async fn stop_agent(&self, name: &str) -> Result<(), SupervisorError> {
        let Some(entry) = self.table.entry(name).await else {
            return Err(SupervisorError::UnknownAgent(name.to_string()));
        };
        let exit = self.terminate_process(name).await;
        {
            let mut state = entry.lock().await;
            let _ = state.transition(AgentStatus::Stopped);
            state.exit_code = state.exit_code.or(exit);
            state.pid = None;
        }
        self.table.retire(name).await;
        info!(agent = %name, "Agent stopped");
        Ok(())
    }

    /// Stop every live agent in reverse wave order.
    pub async fn stop_all(&self) {
        let waves = self.graph.waves().clone();
        for wave in waves.iter().rev() {
            for name in wave.iter().rev() {
                if self.table.entry(name).await.is_some() {
                    if let Err(e) = self.stop_agent(name).await {
                        warn!(agent = %name, error = %e, "Failed to stop agent");
                    }
                }
            }
        }
    }

    /// Terminate the current process of `name`, if any.
    async fn terminate_process(&self, name: &str) -> Option<i32> {
        let mut handle = self.handles.lock().await.remove(name)?;
        match self.launcher.terminate(&mut handle, self.config.stop_grace).await {
            Ok(code) => code,
            Err(e) => {
                warn!(agent = %name, error = %e, "Failed to terminate agent");
                None
            }
        }
    }

    /// Sleep for `delay`. Returns false if shutdown was signalled first.
    async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = signalled(self.shutdown.clone()) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::health::ScriptedProbe;
    use crate::runtime::MockLauncher;
    use fleet_events::ProbeClassification::*;

    struct Fixture {
        supervisor: Arc<Supervisor>,
        launcher: Arc<MockLauncher>,
        probe: Arc<ScriptedProbe>,
        bus: ErrorBus,
        shutdown: watch::Sender<bool>,
    }

    fn fixture(specs: Vec<AgentSpec>) -> Fixture {
        let graph = Arc::new(DependencyGraph::build(&specs).unwrap());
        let launcher = Arc::new(MockLauncher::new());
        let probe = Arc::new(ScriptedProbe::new());
        let bus = ErrorBus::new(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = SupervisorConfig {
            wave_timeout: Duration::from_secs(2),
            startup_probe_interval: Duration::from_millis(100),
            stop_grace: Duration::from_millis(10),
        };
        let supervisor = Arc::new(Supervisor::new(
            graph,
            launcher.clone(),
            probe.clone(),
            Arc::new(StateTable::new()),
            bus.clone(),
            config,
            shutdown_rx,
        ));
        Fixture {
            supervisor,
            launcher,
            probe,
            bus,
            shutdown,
        }
    }

    fn chain() -> Vec<AgentSpec> {
        vec![
            AgentSpec::new("a", "localhost", 9000, 9001),
            AgentSpec::new("b", "localhost", 9010, 9011).depends_on("a"),
            AgentSpec::new("c", "localhost", 9020, 9021).depends_on("b"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_all_healthy() {
        let f = fixture(chain());
        let summary = f.supervisor.launch_all().await.unwrap();

        assert_eq!(summary.waves.len(), 3);
        assert_eq!(f.supervisor.completed_waves(), 3);
        for name in ["a", "b", "c"] {
            assert_eq!(f.supervisor.table().status(name).await, Some(AgentStatus::Healthy));
            assert_eq!(f.launcher.spawn_count(name), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wave_timeout_names_agent_and_history() {
        let f = fixture(chain());
        let mut critical = f.bus.subscribe(EventFilter::min_severity(Severity::Critical));
        f.probe.set_fallback("a", Timeout);

        let err = f.supervisor.launch_all().await.unwrap_err();
        let SupervisorError::WaveTimeout { wave, blocked } = &err else {
            panic!("expected a wave timeout, got {err}");
        };
        assert_eq!(*wave, 0);
        assert_eq!(blocked[0].agent, "a");
        assert_eq!(blocked[0].reason, BlockReason::TimedOut);
        assert!(!blocked[0].probe_history.is_empty());
        assert!(err.to_string().contains("a ("));

        // Later waves were never launched.
        assert_eq!(f.launcher.spawn_count("b"), 0);
        assert_eq!(f.launcher.spawn_count("c"), 0);
        // The started agent is left running.
        assert_eq!(f.launcher.terminate_count("a"), 0);
        assert_eq!(f.supervisor.table().status("a").await, Some(AgentStatus::Unreachable));

        let event = critical.recv().await.unwrap();
        assert_eq!(event.kind(), Some("WaveTimeout"));
        assert_eq!(event.context["agents"], "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_agent_does_not_block() {
        let specs = vec![
            AgentSpec::new("a", "localhost", 9000, 9001),
            AgentSpec::new("dashboard", "localhost", 9100, 9101).optional(),
            AgentSpec::new("b", "localhost", 9010, 9011).depends_on("a"),
        ];
        let f = fixture(specs);
        f.probe.set_fallback("dashboard", Unhealthy);

        let started = Instant::now();
        let summary = f.supervisor.launch_all().await.unwrap();
        assert_eq!(summary.waves[0].optional, vec!["dashboard".to_string()]);
        assert_eq!(f.supervisor.table().status("b").await, Some(AgentStatus::Healthy));

        // Spawned before the launch returns, without holding waves to the timeout.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(f.launcher.spawn_count("dashboard"), 1);
        assert_eq!(
            f.supervisor.table().status("dashboard").await,
            Some(AgentStatus::Unhealthy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_agent_is_spawned_with_its_wave() {
        let specs = vec![
            AgentSpec::new("a", "localhost", 9000, 9001),
            AgentSpec::new("dashboard", "localhost", 9100, 9101).optional(),
        ];
        let f = fixture(specs);

        f.supervisor.launch_all().await.unwrap();
        assert_eq!(f.launcher.spawn_count("dashboard"), 1);
        assert_eq!(
            f.supervisor.table().status("dashboard").await,
            Some(AgentStatus::Healthy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_is_launch_error() {
        let f = fixture(chain());
        f.launcher.fail_spawn("a", "no such file");

        let err = f.supervisor.launch_all().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { wave: 0, .. }));
        let state = f.supervisor.table().snapshot("a").await.unwrap();
        assert_eq!(state.status, AgentStatus::Failed);
        assert!(!state.ever_started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_process_blocks_wave() {
        let f = fixture(chain());
        f.probe.set_fallback("a", TransportFailure);
        let supervisor = Arc::clone(&f.supervisor);
        let launch = tokio::spawn(async move { supervisor.launch_all().await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        f.launcher.exit("a", 2);

        let err = launch.await.unwrap().unwrap_err();
        assert_eq!(err.blocked()[0].reason, BlockReason::Exited { code: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_launch_without_killing() {
        let f = fixture(chain());
        f.probe.set_fallback("b", Timeout);
        let supervisor = Arc::clone(&f.supervisor);
        let launch = tokio::spawn(async move { supervisor.launch_all().await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        f.shutdown.send(true).unwrap();

        let err = launch.await.unwrap().unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled { completed_waves: 1 }));
        assert_eq!(f.launcher.spawn_count("c"), 0);
        assert_eq!(f.launcher.terminate_count("a"), 0);
        assert_eq!(f.launcher.terminate_count("b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_agent_is_idempotent_per_boot() {
        let f = fixture(chain());
        f.supervisor.launch_all().await.unwrap();

        let old_boot = f.launcher.current_boot("b");
        f.probe.push("b", [Timeout]);
        let (_, change) = f.supervisor.probe_agent("b").await.unwrap();
        assert_eq!(change.unwrap().current, AgentStatus::Unreachable);

        let first = f.supervisor.restart_agent("b", old_boot, Duration::from_millis(10));
        let second = f.supervisor.restart_agent("b", old_boot, Duration::from_millis(10));
        let (r1, r2) = tokio::join!(first, second);
        r1.unwrap();
        r2.unwrap();

        // A stale decision for the old boot is ignored too.
        f.supervisor
            .restart_agent("b", old_boot, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(f.launcher.spawn_count("b"), 2);
        let state = f.supervisor.table().snapshot("b").await.unwrap();
        assert_eq!(state.status, AgentStatus::Healthy);
        assert_eq!(state.restarts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_group_relaunches_members_in_order() {
        let specs = vec![
            AgentSpec::new("store", "localhost", 9000, 9001).in_group("speech"),
            AgentSpec::new("asr", "localhost", 9010, 9011)
                .depends_on("store")
                .in_group("speech"),
            AgentSpec::new("ui", "localhost", 9020, 9021),
        ];
        let f = fixture(specs);
        f.supervisor.launch_all().await.unwrap();

        f.supervisor
            .restart_group("speech", Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(f.launcher.spawn_count("store"), 2);
        assert_eq!(f.launcher.spawn_count("asr"), 2);
        assert_eq!(f.launcher.spawn_count("ui"), 1);
        assert_eq!(f.supervisor.table().status("asr").await, Some(AgentStatus::Healthy));

        let err = f.supervisor.restart_group("nope", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownGroup(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_system_relaunches_completed_waves() {
        let f = fixture(chain());
        f.supervisor.launch_all().await.unwrap();

        f.supervisor.restart_system(Duration::ZERO).await.unwrap();
        for name in ["a", "b", "c"] {
            assert_eq!(f.launcher.spawn_count(name), 2);
            assert_eq!(f.launcher.terminate_count(name), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_system_mid_launch_finishes_later_waves() {
        let f = fixture(chain());
        f.probe.push("b", [Timeout, Timeout]);
        let supervisor = Arc::clone(&f.supervisor);
        let launch = tokio::spawn(async move { supervisor.launch_all().await });

        // a is healthy; b is still coming up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.supervisor.completed_waves(), 1);
        f.supervisor.restart_system(Duration::ZERO).await.unwrap();

        let err = launch.await.unwrap().unwrap_err();
        assert!(matches!(err, SupervisorError::Halted { .. }), "{err}");
        assert_eq!(f.supervisor.completed_waves(), 3);
        assert_eq!(f.launcher.spawn_count("a"), 2);
        assert_eq!(f.launcher.spawn_count("c"), 1);
        for name in ["a", "b", "c"] {
            assert_eq!(f.supervisor.table().status(name).await, Some(AgentStatus::Healthy));
        }

        // Later launches are no longer halted.
        f.supervisor.restart_system(Duration::ZERO).await.unwrap();
        assert_eq!(f.launcher.spawn_count("c"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_failed_refuses_recovered_agent() {
        let f = fixture(chain());
        f.supervisor.launch_all().await.unwrap();
        let pid = f.supervisor.table().snapshot("c").await.unwrap().pid;

        let err = f.supervisor.mark_failed("c").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Transition(_)), "{err}");

        assert_eq!(f.launcher.terminate_count("c"), 0);
        let state = f.supervisor.table().snapshot("c").await.unwrap();
        assert_eq!(state.status, AgentStatus::Healthy);
        assert_eq!(state.pid, pid);
        assert!(pid.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_failed_retires_agent() {
        let f = fixture(chain());
        f.supervisor.launch_all().await.unwrap();
        f.probe.push("c", [Unhealthy]);
        f.supervisor.probe_agent("c").await.unwrap();

        f.supervisor.mark_failed("c").await.unwrap();
        assert!(f.supervisor.table().snapshot("c").await.is_none());
        let last = f.supervisor.table().last_known("c").await.unwrap();
        assert_eq!(last.status, AgentStatus::Failed);
        assert_eq!(f.launcher.terminate_count("c"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_in_reverse_order() {
        let f = fixture(chain());
        f.supervisor.launch_all().await.unwrap();
        f.supervisor.stop_all().await;

        assert!(f.supervisor.table().is_empty().await);
        let order: Vec<_> = f
            .supervisor
            .table()
            .history()
            .await
            .into_iter()
            .map(|s| (s.name, s.status))
            .collect();
        assert_eq!(
            order,
            vec![
                ("c".to_string(), AgentStatus::Stopped),
                ("b".to_string(), AgentStatus::Stopped),
                ("a".to_string(), AgentStatus::Stopped),
            ]
        );
    }
}
