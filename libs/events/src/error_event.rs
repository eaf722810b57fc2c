//! Structured events carried by the error bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_id::ErrorEventId;
use serde::{Deserialize, Serialize};

/// Context key holding the [`FleetErrorKind`] of an event.
pub const KIND_CONTEXT_KEY: &str = "kind";

/// Event severity. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FleetErrorKind {
    UnknownDependency,
    CyclicDependency,
    ProbeTimeout,
    ProbeTransportFailure,
    HealthyButDegraded,
    WaveTimeout,
    RecoveryExhausted,
    HubUnreachable,
}

impl FleetErrorKind {
    /// Stable name used in event context and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownDependency => "UnknownDependency",
            Self::CyclicDependency => "CyclicDependency",
            Self::ProbeTimeout => "ProbeTimeout",
            Self::ProbeTransportFailure => "ProbeTransportFailure",
            Self::HealthyButDegraded => "HealthyButDegraded",
            Self::WaveTimeout => "WaveTimeout",
            Self::RecoveryExhausted => "RecoveryExhausted",
            Self::HubUnreachable => "HubUnreachable",
        }
    }

    /// Load-time errors abort the whole run.
    pub fn is_load_time(&self) -> bool {
        matches!(self, Self::UnknownDependency | Self::CyclicDependency)
    }

    /// Errors surfaced to the operator as hard failures.
    pub fn is_operator_facing(&self) -> bool {
        matches!(self, Self::RecoveryExhausted | Self::WaveTimeout) || self.is_load_time()
    }
}

impl std::fmt::Display for FleetErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error/severity event. Published once; never acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: ErrorEventId,
    pub severity: Severity,
    /// Component or agent name that raised the event.
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    /// Create an event stamped with the current time.
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: ErrorEventId::new(),
            severity,
            source: source.into(),
            message: message.into(),
            context: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Tag the event with a taxonomy kind.
    pub fn with_kind(self, kind: FleetErrorKind) -> Self {
        self.with_context(KIND_CONTEXT_KEY, kind.as_str())
    }

    /// The taxonomy kind this event was tagged with, if any.
    pub fn kind(&self) -> Option<&str> {
        self.context.get(KIND_CONTEXT_KEY).map(String::as_str)
    }
}
