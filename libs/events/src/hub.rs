//! Hub records and the aggregate health view.
//!
//! Edge Hubs create `HubRecord`s from local observations and forward them to
//! the Central Hub in `RecordBatch`es. Central answers with a `BatchAck`; once
//! a record is acknowledged, Central owns its canonical copy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_id::RecordId;
use serde::{Deserialize, Serialize};

use crate::error_event::Severity;
use crate::probe::{HealthProbeResult, ProbeClassification};
use crate::status::AgentStatus;

/// Synchronization state of a hub record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Only the observing edge holds the record.
    #[default]
    Local,
    /// Sent to Central, not yet acknowledged.
    Forwarded,
    /// Central owns the canonical copy.
    Acknowledged,
}

/// A health/metrics snapshot observed on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubRecord {
    pub record_id: RecordId,
    pub origin_host: String,
    pub observed_at: DateTime<Utc>,
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ProbeClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub sync_state: SyncState,
    /// Set on records re-sent after a Central outage.
    #[serde(default)]
    pub replayed: bool,
}

impl HubRecord {
    /// Snapshot an agent's status on `origin_host`.
    pub fn new(
        origin_host: impl Into<String>,
        agent_name: impl Into<String>,
        status: AgentStatus,
    ) -> Self {
        Self {
            record_id: RecordId::new(),
            origin_host: origin_host.into(),
            observed_at: Utc::now(),
            agent_name: agent_name.into(),
            status,
            classification: None,
            latency_ms: None,
            metrics: BTreeMap::new(),
            sync_state: SyncState::Local,
            replayed: false,
        }
    }

    /// Build a record from a probe result and the status it produced.
    pub fn from_probe(
        origin_host: impl Into<String>,
        result: &HealthProbeResult,
        status: AgentStatus,
    ) -> Self {
        let mut record = Self::new(origin_host, result.agent_name.clone(), status);
        record.observed_at = result.timestamp;
        record.classification = Some(result.classification);
        record.latency_ms = Some(result.latency_ms());
        record
            .metrics
            .insert("probe_latency_ms".to_string(), result.latency_ms() as f64);
        if let Some(uptime) = result
            .raw_payload
            .as_ref()
            .and_then(|p| p.get("uptime"))
            .and_then(|v| v.as_f64())
        {
            record.metrics.insert("uptime_secs".to_string(), uptime);
        }
        record
    }
}

/// A span of time during which Central was unreachable from an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutageWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl OutageWindow {
    /// Returns true if `at` falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since <= at && at <= self.until
    }
}

/// A batch of records pushed from an edge to Central.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub origin_host: String,
    pub sent_at: DateTime<Utc>,
    pub records: Vec<HubRecord>,
    /// True when this batch replays the buffer after an outage.
    #[serde(default)]
    pub replay: bool,
    /// The outage that ended with this replay, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub central_outage: Option<OutageWindow>,
}

/// Central's answer to a [`RecordBatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    /// Records stored for the first time.
    pub accepted: Vec<RecordId>,
    /// Records Central already had.
    pub duplicates: Vec<RecordId>,
}

impl BatchAck {
    /// Every record Central now owns, new or duplicate.
    pub fn acknowledged(&self) -> impl Iterator<Item = &RecordId> {
        self.accepted.iter().chain(self.duplicates.iter())
    }
}

/// Kind of cross-host alert raised by Central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubAlertKind {
    /// One edge stopped reporting while Central stayed up.
    EdgeDown,
    /// An edge went silent across a Central outage.
    BothHubsDown,
}

impl HubAlertKind {
    /// Severity attached to this kind of alert.
    pub fn severity(&self) -> Severity {
        match self {
            Self::EdgeDown => Severity::Error,
            Self::BothHubsDown => Severity::Critical,
        }
    }
}

/// A cross-host alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubAlert {
    pub kind: HubAlertKind,
    pub host: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Reachability of one host's edge hub as seen by Central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubLinkState {
    Up,
    Down,
}

/// Per-host hub status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHubStatus {
    pub host: String,
    pub state: HubLinkState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub records_received: u64,
    pub replayed_records: u64,
}

/// Latest known health of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealthView {
    pub agent_name: String,
    pub origin_host: String,
    pub status: AgentStatus,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Response of Central's read endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub generated_at: DateTime<Utc>,
    pub agents: Vec<AgentHealthView>,
    pub hosts: Vec<HostHubStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub alerts: Vec<HubAlert>,
}

/// Request for Central to authorize a fleet-wide restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub origin_host: String,
    pub agent_name: String,
    pub group: String,
    pub reason: String,
}

/// Central's decision on an [`EscalationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub approved: bool,
    pub reason: String,
}
