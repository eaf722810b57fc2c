//! Recovery engine.
//!
//! Consumes probe results and error events and decides what to do about
//! them. Decisions are returned as [`RecoveryAction`]s; the supervisor
//! carries them out.
//!
//! Per agent the engine tracks consecutive probe failures and a restart
//! attempt counter:
//!
//! - failures below the policy's `max_retries` ask for another probe
//! - the failure that reaches `max_retries` escalates once, using the
//!   policy's tier and a delay of `base * multiplier^attempt` (capped)
//! - any further failure before a healthy probe exhausts recovery
//!
//! A healthy probe clears the failure count. The attempt counter only
//! resets after the agent stays healthy for twice the base backoff, so an
//! agent that flaps keeps backing off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{
    AgentSpec, AgentStatus, ErrorEvent, EscalationDecision, EscalationRequest, EscalationTier,
    FleetErrorKind, HealthProbeResult, PolicySet, RecoveryPolicy, Severity,
};
use fleet_graph::DependencyGraph;
use fleet_id::BootId;
use tracing::{debug, info, warn};

use crate::bus::ErrorBus;
use crate::state::StateTable;

/// Component name used as the source of engine events.
pub const RECOVERY_SOURCE: &str = "recovery";

const PROBE_KINDS: [FleetErrorKind; 3] = [
    FleetErrorKind::ProbeTimeout,
    FleetErrorKind::ProbeTransportFailure,
    FleetErrorKind::HealthyButDegraded,
];

/// What the supervisor should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing to do.
    None,

    /// Probe the agent again after `after`.
    Reprobe { agent: String, after: Duration },

    /// Restart one process instance.
    RestartProcess {
        agent: String,
        boot_id: Option<BootId>,
        delay: Duration,
        attempt: u32,
    },

    /// Restart every member of `group`, in dependency order.
    RestartGroup {
        group: String,
        trigger: String,
        delay: Duration,
        attempt: u32,
    },

    /// Restart the fleet from the last completed wave boundary.
    SystemWide {
        trigger: String,
        delay: Duration,
        attempt: u32,
    },

    /// Retries are used up; the agent is failed.
    Exhausted { agent: String, failures: u32 },
}

impl RecoveryAction {
    /// Returns true for actions that relaunch processes.
    pub fn is_restart(&self) -> bool {
        matches!(
            self,
            Self::RestartProcess { .. } | Self::RestartGroup { .. } | Self::SystemWide { .. }
        )
    }

    /// Restart delay, if this is a restart.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::RestartProcess { delay, .. }
            | Self::RestartGroup { delay, .. }
            | Self::SystemWide { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}

/// Inputs to an escalation.
#[derive(Debug, Clone)]
pub struct EscalationContext<'a> {
    pub spec: &'a AgentSpec,
    pub boot_id: Option<BootId>,
    pub delay: Duration,
    pub attempt: u32,
}

/// Maps an escalation to the action implementing it.
pub trait RecoveryStrategy {
    fn apply(&self, ctx: &EscalationContext<'_>) -> RecoveryAction;
}

impl RecoveryStrategy for EscalationTier {
    fn apply(&self, ctx: &EscalationContext<'_>) -> RecoveryAction {
        match self {
            EscalationTier::RestartProcess => RecoveryAction::RestartProcess {
                agent: ctx.spec.name.clone(),
                boot_id: ctx.boot_id,
                delay: ctx.delay,
                attempt: ctx.attempt,
            },
            EscalationTier::RestartGroup => RecoveryAction::RestartGroup {
                group: ctx.spec.group.clone(),
                trigger: ctx.spec.name.clone(),
                delay: ctx.delay,
                attempt: ctx.attempt,
            },
            EscalationTier::SystemWide => RecoveryAction::SystemWide {
                trigger: ctx.spec.name.clone(),
                delay: ctx.delay,
                attempt: ctx.attempt,
            },
        }
    }
}

/// Grants or refuses fleet-wide restarts.
#[async_trait]
pub trait EscalationAuthority: Send + Sync {
    async fn authorize(&self, request: &EscalationRequest) -> EscalationDecision;
}

/// Authority with a fixed answer. Used when no Central hub is configured
/// and in tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthority {
    approve: bool,
}

impl StaticAuthority {
    pub fn approve_all() -> Self {
        Self { approve: true }
    }

    pub fn deny_all() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl EscalationAuthority for StaticAuthority {
    async fn authorize(&self, _request: &EscalationRequest) -> EscalationDecision {
        EscalationDecision {
            approved: self.approve,
            reason: if self.approve {
                "approved locally".to_string()
            } else {
                "fleet-wide restarts are disabled".to_string()
            },
        }
    }
}

#[derive(Debug, Default)]
struct Tracker {
    consecutive_failures: u32,
    attempt: u32,
    last_seen: Option<DateTime<Utc>>,
    healthy_since: Option<DateTime<Utc>>,
    /// Instance a restart was already issued for.
    escalated_boot: Option<BootId>,
    exhausted: bool,
}

/// Decision state machine over probe results.
pub struct RecoveryEngine {
    graph: Arc<DependencyGraph>,
    policies: PolicySet,
    table: Arc<StateTable>,
    authority: Arc<dyn EscalationAuthority>,
    bus: ErrorBus,
    host: String,
    trackers: Mutex<HashMap<String, Tracker>>,
}

impl RecoveryEngine {
    pub fn new(
        graph: Arc<DependencyGraph>,
        policies: PolicySet,
        table: Arc<StateTable>,
        authority: Arc<dyn EscalationAuthority>,
        bus: ErrorBus,
        host: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            policies,
            table,
            authority,
            bus,
            host: host.into(),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Policy in force for `agent`.
    pub fn policy_for(&self, agent: &str) -> Option<RecoveryPolicy> {
        self.graph.spec(agent).map(|spec| self.policies.resolve(spec))
    }

    /// Decide what to do about one probe result.
    ///
    /// Feeding the same result twice yields at most one restart.
    pub async fn on_probe_result(&self, result: &HealthProbeResult) -> RecoveryAction {
        let Some(spec) = self.graph.spec(&result.agent_name) else {
            warn!(agent = %result.agent_name, "Probe result for unknown agent");
            return RecoveryAction::None;
        };
        let policy = self.policies.resolve(spec);

        // Starting agents are probed by the supervisor's launch loop; a
        // finished or retired agent has nothing left to recover.
        match self.table.status(&spec.name).await {
            Some(status) if status.is_running() && status != AgentStatus::Starting => {}
            _ => return RecoveryAction::None,
        }

        let (decision, failures) = {
            let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            let tracker = trackers.entry(spec.name.clone()).or_default();
            let decision = Self::decide(tracker, spec, &policy, result);
            (decision, tracker.consecutive_failures)
        };

        if let Some(entry) = self.table.entry(&spec.name).await {
            entry.lock().await.consecutive_failures = failures;
        }

        match decision {
            RecoveryAction::SystemWide { .. } => self.authorize_system_wide(spec, decision).await,
            RecoveryAction::Exhausted { failures, .. } => {
                warn!(agent = %spec.name, failures, "Recovery exhausted");
                self.bus.publish(
                    ErrorEvent::new(
                        Severity::Critical,
                        spec.name.clone(),
                        format!(
                            "recovery exhausted after {} consecutive probe failures",
                            failures
                        ),
                    )
                    .with_kind(FleetErrorKind::RecoveryExhausted)
                    .with_context("max_retries", policy.max_retries),
                );
                decision
            }
            RecoveryAction::RestartProcess { delay, attempt, .. }
            | RecoveryAction::RestartGroup { delay, attempt, .. } => {
                info!(
                    agent = %spec.name,
                    tier = %policy.escalation_tier,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Escalating after repeated probe failures"
                );
                decision
            }
            other => other,
        }
    }

    /// React to an error event. Events never count as probe failures; a
    /// serious one about a known agent only asks for an early probe.
    ///
    /// Events raised from probe results are skipped: the probe itself was
    /// already fed to [`Self::on_probe_result`].
    pub async fn on_error_event(&self, event: &ErrorEvent) -> RecoveryAction {
        if event.severity < Severity::Error || self.graph.spec(&event.source).is_none() {
            return RecoveryAction::None;
        }
        if event
            .kind()
            .is_some_and(|kind| PROBE_KINDS.iter().any(|k| k.as_str() == kind))
        {
            return RecoveryAction::None;
        }
        match self.table.status(&event.source).await {
            Some(status) if status.is_running() => {
                debug!(agent = %event.source, event_id = %event.id, "Error event requests reprobe");
                RecoveryAction::Reprobe {
                    agent: event.source.clone(),
                    after: Duration::ZERO,
                }
            }
            _ => RecoveryAction::None,
        }
    }

    /// Consecutive failures currently counted for `agent`.
    pub fn consecutive_failures(&self, agent: &str) -> u32 {
        let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers
            .get(agent)
            .map(|t| t.consecutive_failures)
            .unwrap_or(0)
    }

    /// Restart attempts counted for `agent` since it was last stable.
    pub fn attempt(&self, agent: &str) -> u32 {
        let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers.get(agent).map(|t| t.attempt).unwrap_or(0)
    }

    fn decide(
        tracker: &mut Tracker,
        spec: &AgentSpec,
        policy: &RecoveryPolicy,
        result: &HealthProbeResult,
    ) -> RecoveryAction {
        if tracker.exhausted {
            return RecoveryAction::None;
        }
        if tracker.last_seen.is_some_and(|seen| result.timestamp <= seen) {
            return RecoveryAction::None;
        }
        tracker.last_seen = Some(result.timestamp);

        if result.classification.is_healthy() {
            tracker.consecutive_failures = 0;
            tracker.escalated_boot = None;
            let since = *tracker.healthy_since.get_or_insert(result.timestamp);
            let stable_for = (result.timestamp - since).to_std().unwrap_or_default();
            if tracker.attempt > 0 && stable_for > policy.base_backoff() * 2 {
                debug!(agent = %spec.name, "Agent stable, resetting restart backoff");
                tracker.attempt = 0;
            }
            return RecoveryAction::None;
        }

        tracker.healthy_since = None;
        if result.boot_id.is_some() && result.boot_id == tracker.escalated_boot {
            // A restart for this instance is already on its way.
            return RecoveryAction::None;
        }

        tracker.consecutive_failures += 1;
        let failures = tracker.consecutive_failures;

        if failures > policy.max_retries {
            tracker.exhausted = true;
            return RecoveryAction::Exhausted {
                agent: spec.name.clone(),
                failures,
            };
        }

        if failures == policy.max_retries {
            let ctx = EscalationContext {
                spec,
                boot_id: result.boot_id,
                delay: policy.backoff(tracker.attempt),
                attempt: tracker.attempt,
            };
            tracker.attempt = tracker.attempt.saturating_add(1);
            tracker.escalated_boot = result.boot_id;
            return policy.escalation_tier.apply(&ctx);
        }

        RecoveryAction::Reprobe {
            agent: spec.name.clone(),
            after: policy.base_backoff(),
        }
    }

    async fn authorize_system_wide(
        &self,
        spec: &AgentSpec,
        decision: RecoveryAction,
    ) -> RecoveryAction {
        let RecoveryAction::SystemWide { trigger, delay, attempt } = decision else {
            return decision;
        };
        let request = EscalationRequest {
            origin_host: self.host.clone(),
            agent_name: spec.name.clone(),
            group: spec.group.clone(),
            reason: format!("{} exceeded its probe failure threshold", spec.name),
        };

        let verdict = self.authority.authorize(&request).await;
        if verdict.approved {
            info!(agent = %spec.name, reason = %verdict.reason, "Fleet-wide restart approved");
            return RecoveryAction::SystemWide { trigger, delay, attempt };
        }

        warn!(
            agent = %spec.name,
            reason = %verdict.reason,
            "Fleet-wide restart refused, restarting group instead"
        );
        self.bus.publish(
            ErrorEvent::new(
                Severity::Warning,
                RECOVERY_SOURCE,
                format!("fleet-wide restart for {} refused: {}", spec.name, verdict.reason),
            )
            .with_context("agent", &spec.name)
            .with_context("group", &spec.group),
        );
        RecoveryAction::RestartGroup {
            group: spec.group.clone(),
            trigger,
            delay,
            attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use fleet_events::ProbeClassification;

    struct Harness {
        engine: RecoveryEngine,
        table: Arc<StateTable>,
        bus: ErrorBus,
        start: DateTime<Utc>,
    }

    impl Harness {
        async fn new(policy: RecoveryPolicy, authority: Arc<dyn EscalationAuthority>) -> Self {
            let specs = vec![
                AgentSpec::new("store", "localhost", 9100, 9101).in_group("speech"),
                AgentSpec::new("asr", "localhost", 9000, 9001)
                    .depends_on("store")
                    .in_group("speech"),
            ];
            let graph = Arc::new(DependencyGraph::build(&specs).unwrap());
            let table = Arc::new(StateTable::new());
            for spec in &specs {
                let entry = table.register(&spec.name).await;
                let mut state = entry.lock().await;
                state.transition(AgentStatus::Starting).unwrap();
                state.transition(AgentStatus::Unreachable).unwrap();
            }
            let bus = ErrorBus::new(64);
            let policies = PolicySet {
                default: policy,
                ..Default::default()
            };
            let engine = RecoveryEngine::new(
                graph,
                policies,
                Arc::clone(&table),
                authority,
                bus.clone(),
                "host-a",
            );
            Self {
                engine,
                table,
                bus,
                start: Utc::now(),
            }
        }

        fn result(
            &self,
            classification: ProbeClassification,
            at_ms: i64,
            boot: BootId,
        ) -> HealthProbeResult {
            HealthProbeResult {
                agent_name: "asr".to_string(),
                boot_id: Some(boot),
                timestamp: self.start + chrono::Duration::milliseconds(at_ms),
                round_trip_latency: Duration::from_millis(1),
                classification,
                status_token: None,
                raw_payload: None,
                detail: None,
            }
        }
    }

    fn policy(tier: EscalationTier) -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: 3,
            base_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
            escalation_tier: tier,
        }
    }

    #[tokio::test]
    async fn test_threshold_then_restart_then_exhausted() {
        let h = Harness::new(
            policy(EscalationTier::RestartProcess),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let mut events = h.bus.subscribe(EventFilter::min_severity(Severity::Critical));
        let boot = BootId::new();

        for i in 1..=2 {
            let result = h.result(ProbeClassification::Timeout, i, boot);
            let action = h.engine.on_probe_result(&result).await;
            assert!(matches!(action, RecoveryAction::Reprobe { .. }));
        }
        let result = h.result(ProbeClassification::Timeout, 3, boot);
        let action = h.engine.on_probe_result(&result).await;
        assert_eq!(
            action,
            RecoveryAction::RestartProcess {
                agent: "asr".to_string(),
                boot_id: Some(boot),
                delay: Duration::from_millis(100),
                attempt: 0,
            }
        );
        assert_eq!(h.table.snapshot("asr").await.unwrap().consecutive_failures, 3);

        // The restarted instance fails once more.
        let action = h
            .engine
            .on_probe_result(&h.result(ProbeClassification::TransportFailure, 4, BootId::new()))
            .await;
        assert_eq!(
            action,
            RecoveryAction::Exhausted {
                agent: "asr".to_string(),
                failures: 4
            }
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), Some("RecoveryExhausted"));
        assert_eq!(event.source, "asr");
    }

    #[tokio::test]
    async fn test_same_result_twice_restarts_once() {
        let h = Harness::new(
            policy(EscalationTier::RestartProcess),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let boot = BootId::new();
        h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, 1, boot)).await;
        h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, 2, boot)).await;

        let third = h.result(ProbeClassification::Timeout, 3, boot);
        assert!(h.engine.on_probe_result(&third).await.is_restart());
        assert_eq!(h.engine.on_probe_result(&third).await, RecoveryAction::None);

        // A later failure of the same instance does not count either.
        let later = h.result(ProbeClassification::Timeout, 4, boot);
        assert_eq!(h.engine.on_probe_result(&later).await, RecoveryAction::None);
        assert_eq!(h.engine.consecutive_failures("asr"), 3);
    }

    #[tokio::test]
    async fn test_starting_agent_is_not_restarted() {
        let h = Harness::new(
            policy(EscalationTier::RestartProcess),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        {
            let entry = h.table.entry("asr").await.unwrap();
            entry.lock().await.transition(AgentStatus::Starting).unwrap();
        }
        let boot = BootId::new();
        for i in 1..=5 {
            let result = h.result(ProbeClassification::Timeout, i, boot);
            let action = h.engine.on_probe_result(&result).await;
            assert_eq!(action, RecoveryAction::None);
        }
    }

    #[tokio::test]
    async fn test_healthy_probe_clears_failures() {
        let h = Harness::new(
            policy(EscalationTier::RestartProcess),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let boot = BootId::new();
        h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, 1, boot)).await;
        h.engine.on_probe_result(&h.result(ProbeClassification::Unhealthy, 2, boot)).await;
        h.engine.on_probe_result(&h.result(ProbeClassification::Healthy, 3, boot)).await;
        assert_eq!(h.engine.consecutive_failures("asr"), 0);
    }

    #[tokio::test]
    async fn test_error_events_only_reprobe() {
        let h = Harness::new(
            policy(EscalationTier::RestartProcess),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let event = ErrorEvent::new(Severity::Critical, "asr", "model crashed");
        for _ in 0..10 {
            assert_eq!(
                h.engine.on_error_event(&event).await,
                RecoveryAction::Reprobe {
                    agent: "asr".to_string(),
                    after: Duration::ZERO
                }
            );
        }
        assert_eq!(h.engine.consecutive_failures("asr"), 0);

        let minor = ErrorEvent::new(Severity::Warning, "asr", "slow");
        assert_eq!(h.engine.on_error_event(&minor).await, RecoveryAction::None);
        let foreign = ErrorEvent::new(Severity::Critical, "unknown", "boom");
        assert_eq!(h.engine.on_error_event(&foreign).await, RecoveryAction::None);
        let from_probe = ErrorEvent::new(Severity::Error, "asr", "regressed")
            .with_kind(FleetErrorKind::ProbeTimeout);
        assert_eq!(h.engine.on_error_event(&from_probe).await, RecoveryAction::None);
    }

    #[tokio::test]
    async fn test_group_tier() {
        let h = Harness::new(
            policy(EscalationTier::RestartGroup),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let boot = BootId::new();
        let mut last = RecoveryAction::None;
        for i in 1..=3 {
            last = h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, i, boot)).await;
        }
        assert!(matches!(
            last,
            RecoveryAction::RestartGroup { ref group, ref trigger, .. }
                if group == "speech" && trigger == "asr"
        ));
    }

    #[tokio::test]
    async fn test_system_wide_denied_downgrades_to_group() {
        let h = Harness::new(
            policy(EscalationTier::SystemWide),
            Arc::new(StaticAuthority::deny_all()),
        )
        .await;
        let mut warnings = h.bus.subscribe(EventFilter::all().from_source(RECOVERY_SOURCE));
        let boot = BootId::new();
        let mut last = RecoveryAction::None;
        for i in 1..=3 {
            last = h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, i, boot)).await;
        }
        assert!(matches!(last, RecoveryAction::RestartGroup { .. }));
        assert_eq!(warnings.recv().await.unwrap().severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_system_wide_approved() {
        let h = Harness::new(
            policy(EscalationTier::SystemWide),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let boot = BootId::new();
        let mut last = RecoveryAction::None;
        for i in 1..=3 {
            last = h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, i, boot)).await;
        }
        assert!(matches!(last, RecoveryAction::SystemWide { .. }));
    }

    #[tokio::test]
    async fn test_sustained_health_resets_backoff() {
        let h = Harness::new(
            policy(EscalationTier::RestartProcess),
            Arc::new(StaticAuthority::approve_all()),
        )
        .await;
        let boot = BootId::new();
        for i in 1..=3 {
            h.engine.on_probe_result(&h.result(ProbeClassification::Timeout, i, boot)).await;
        }
        assert_eq!(h.engine.attempt("asr"), 1);

        // A short healthy blip keeps the attempt counter.
        let restarted = BootId::new();
        h.engine.on_probe_result(&h.result(ProbeClassification::Healthy, 10, restarted)).await;
        h.engine.on_probe_result(&h.result(ProbeClassification::Healthy, 150, restarted)).await;
        assert_eq!(h.engine.attempt("asr"), 1);

        // Healthy for more than twice the 100ms base backoff.
        h.engine.on_probe_result(&h.result(ProbeClassification::Healthy, 310, restarted)).await;
        assert_eq!(h.engine.attempt("asr"), 0);
    }
}
