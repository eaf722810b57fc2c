//! Health protocol messages and probe results.
//!
//! Wire format (one JSON object per line):
//!
//! ```text
//! -> {"action":"health_check"}
//! <- {"status":"ok","ready":true,"initialized":true,"timestamp":"...","uptime":12.5, ...}
//! ```
//!
//! Only `status` is required. Every other field is agent-specific and is
//! carried through untouched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::BootId;
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::status::AgentStatus;

/// Action string of the health-check request.
pub const HEALTH_CHECK_ACTION: &str = "health_check";

/// Health-check request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest {
    pub action: String,
}

impl HealthRequest {
    /// The standard `{"action":"health_check"}` request.
    pub fn health_check() -> Self {
        Self {
            action: HEALTH_CHECK_ACTION.to_string(),
        }
    }
}

impl Default for HealthRequest {
    fn default() -> Self {
        Self::health_check()
    }
}

/// Health-check response: one required `status` token plus free-form fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status token reported by the agent (`"ok"`, `"HEALTHY"`, ...).
    pub status: String,

    /// Every other field of the response, untouched.
    #[serde(flatten)]
    pub raw_payload: serde_json::Map<String, serde_json::Value>,
}

impl HealthResponse {
    /// Decode a response from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, EventError> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(EventError::InvalidPayload(
                "health response is not a JSON object".to_string(),
            ));
        };

        let status = match map.remove("status") {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => return Err(EventError::MissingStatus),
        };

        Ok(Self {
            status,
            raw_payload: map,
        })
    }

    /// Decode a response from one line of the wire protocol.
    pub fn from_line(line: &str) -> Result<Self, EventError> {
        let value: serde_json::Value = serde_json::from_str(line.trim())?;
        Self::from_value(value)
    }

    /// The `ready` flag, if the agent reported one.
    pub fn ready(&self) -> Option<bool> {
        self.raw_payload.get("ready").and_then(|v| v.as_bool())
    }

    /// The `initialized` flag, if the agent reported one.
    pub fn initialized(&self) -> Option<bool> {
        self.raw_payload.get("initialized").and_then(|v| v.as_bool())
    }

    /// Reported uptime in seconds, if any.
    pub fn uptime_secs(&self) -> Option<f64> {
        self.raw_payload.get("uptime").and_then(|v| v.as_f64())
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeClassification {
    /// The agent answered with an accepted healthy token.
    Healthy,
    /// The agent answered, but reported itself unhealthy.
    Unhealthy,
    /// No answer within the probe timeout.
    Timeout,
    /// Connection refused, reset, malformed reply, or the process exited.
    TransportFailure,
}

impl ProbeClassification {
    /// Returns true if the probe counts as a success.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Returns true if the probe transport itself failed.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Timeout | Self::TransportFailure)
    }

    /// Agent status implied by this classification.
    pub fn implied_status(&self) -> AgentStatus {
        match self {
            Self::Healthy => AgentStatus::Healthy,
            Self::Unhealthy => AgentStatus::Unhealthy,
            Self::Timeout | Self::TransportFailure => AgentStatus::Unreachable,
        }
    }
}

impl std::fmt::Display for ProbeClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeClassification::Healthy => "healthy",
            ProbeClassification::Unhealthy => "unhealthy",
            ProbeClassification::Timeout => "timeout",
            ProbeClassification::TransportFailure => "transport_failure",
        };
        write!(f, "{}", s)
    }
}

/// Result of one probe. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProbeResult {
    /// Agent that was probed.
    pub agent_name: String,

    /// Process instance that was probed, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<BootId>,

    /// When the probe completed.
    pub timestamp: DateTime<Utc>,

    /// Round-trip latency. Capped at the probe timeout.
    pub round_trip_latency: Duration,

    /// Classification of the outcome.
    pub classification: ProbeClassification,

    /// Status token the agent reported, if it answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_token: Option<String>,

    /// The full response object, untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,

    /// Transport error or exit detail for failed probes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthProbeResult {
    /// A probe that got no answer.
    pub fn unreachable(
        agent_name: impl Into<String>,
        classification: ProbeClassification,
        latency: Duration,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            boot_id: None,
            timestamp: Utc::now(),
            round_trip_latency: latency,
            classification,
            status_token: None,
            raw_payload: None,
            detail: Some(detail.into()),
        }
    }

    /// Attach the boot ID of the probed process.
    pub fn for_boot(mut self, boot_id: Option<BootId>) -> Self {
        self.boot_id = boot_id;
        self
    }

    /// Latency in whole milliseconds.
    pub fn latency_ms(&self) -> u64 {
        self.round_trip_latency.as_millis() as u64
    }
}
