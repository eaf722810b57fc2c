use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use fleet_events::{AgentStatus, HealthProbeResult, ProbeClassification};
use fleet_id::BootId;
use serde::Serialize;
use thiserror::Error;

/// Number of probe outcomes kept per agent for diagnostics.
pub const PROBE_HISTORY_LEN: usize = 16;

/// Rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("agent {agent}: invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub agent: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Compact record of one probe, kept for wave-timeout diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub at: DateTime<Utc>,
    pub classification: ProbeClassification,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl std::fmt::Display for ProbeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}ms)", self.classification, self.latency_ms)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Status change produced by applying a probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub agent: String,
    pub previous: AgentStatus,
    pub current: AgentStatus,
    pub boot_id: Option<BootId>,
}

impl StatusChange {
    /// A healthy agent stopped being healthy.
    pub fn is_regression(&self) -> bool {
        self.previous == AgentStatus::Healthy && self.current != AgentStatus::Healthy
    }

    /// The status actually changed.
    pub fn is_transition(&self) -> bool {
        self.previous != self.current
    }
}

/// Mutable runtime state of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRuntimeState {
    pub name: String,
    pub status: AgentStatus,
    pub pid: Option<u32>,
    pub boot_id: Option<BootId>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub last_transition: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_health_payload: Option<serde_json::Value>,
    pub ever_started: bool,
    pub ever_healthy: bool,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub probe_history: VecDeque<ProbeSummary>,
}

impl AgentRuntimeState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentStatus::Pending,
            pid: None,
            boot_id: None,
            start_time: None,
            last_probe_time: None,
            last_transition: Utc::now(),
            consecutive_failures: 0,
            restarts: 0,
            last_health_payload: None,
            ever_started: false,
            ever_healthy: false,
            exit_code: None,
            last_error: None,
            probe_history: VecDeque::with_capacity(PROBE_HISTORY_LEN),
        }
    }

    /// Move to `next`, enforcing the status state machine.
    ///
    /// Returns the previous status.
    pub fn transition(&mut self, next: AgentStatus) -> Result<AgentStatus, InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                agent: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        if previous != next {
            self.status = next;
            self.last_transition = Utc::now();
        }
        Ok(previous)
    }

    /// Record a freshly spawned process instance.
    pub fn begin_boot(&mut self, boot_id: BootId, pid: Option<u32>) {
        if self.ever_started {
            self.restarts += 1;
        }
        self.boot_id = Some(boot_id);
        self.pid = pid;
        self.start_time = Some(Utc::now());
        self.ever_started = true;
        self.exit_code = None;
        self.last_error = None;
        self.last_health_payload = None;
    }

    /// Apply a probe result.
    ///
    /// Results are ignored (returning `None`) when the agent has no live
    /// process, when they belong to a previous boot, or when they are not
    /// newer than the last applied result.
    pub fn record_probe(&mut self, result: &HealthProbeResult) -> Option<StatusChange> {
        if !self.status.is_running() {
            return None;
        }
        if result.boot_id.is_some() && result.boot_id != self.boot_id {
            return None;
        }
        if self
            .last_probe_time
            .is_some_and(|last| result.timestamp <= last)
        {
            return None;
        }

        let next = result.classification.implied_status();
        if !self.status.can_transition_to(next) {
            return None;
        }

        self.last_probe_time = Some(result.timestamp);
        if self.probe_history.len() == PROBE_HISTORY_LEN {
            self.probe_history.pop_front();
        }
        self.probe_history.push_back(ProbeSummary {
            at: result.timestamp,
            classification: result.classification,
            latency_ms: result.latency_ms(),
            detail: result.detail.clone(),
        });
        if result.raw_payload.is_some() {
            self.last_health_payload = result.raw_payload.clone();
        }

        let previous = self.status;
        if previous != next {
            self.status = next;
            self.last_transition = result.timestamp;
        }
        if next == AgentStatus::Healthy {
            self.ever_healthy = true;
        }

        Some(StatusChange {
            agent: self.name.clone(),
            previous,
            current: next,
            boot_id: self.boot_id,
        })
    }

    /// Probe outcomes since the current boot, oldest first.
    pub fn probes_since_boot(&self) -> Vec<ProbeSummary> {
        let since = self.start_time;
        self.probe_history
            .iter()
            .filter(|p| since.is_none_or(|s| p.at >= s))
            .cloned()
            .collect()
    }
}
