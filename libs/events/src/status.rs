//! Agent lifecycle status.

use serde::{Deserialize, Serialize};

/// Runtime status of a supervised agent.
///
/// ```text
/// PENDING -> STARTING -> HEALTHY | UNHEALTHY | UNREACHABLE | FAILED (spawn error)
/// HEALTHY -> UNHEALTHY | UNREACHABLE | STARTING (group or fleet restart)
/// UNHEALTHY | UNREACHABLE -> STARTING (restart) | FAILED (retries exhausted)
/// any -> STOPPED (explicit shutdown, terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Unreachable,
    Failed,
    Stopped,
}

impl AgentStatus {
    /// Returns true for states no transition leaves (other than to `Stopped`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Returns true if the agent has a live process that probes can reach.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Healthy | Self::Unhealthy | Self::Unreachable
        )
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;

        if next == Stopped {
            return *self != Stopped;
        }

        match (self, next) {
            (Pending, Starting) => true,
            (Starting, Healthy | Unhealthy | Unreachable | Failed) => true,
            (Healthy, Unhealthy | Unreachable | Starting) => true,
            (Unhealthy, Healthy | Unreachable | Starting | Failed) => true,
            (Unreachable, Healthy | Unhealthy | Starting | Failed) => true,
            // Probe results that do not change the status are no-ops.
            (a, b) if *a == b => matches!(a, Healthy | Unhealthy | Unreachable),
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "PENDING",
            AgentStatus::Starting => "STARTING",
            AgentStatus::Healthy => "HEALTHY",
            AgentStatus::Unhealthy => "UNHEALTHY",
            AgentStatus::Unreachable => "UNREACHABLE",
            AgentStatus::Failed => "FAILED",
            AgentStatus::Stopped => "STOPPED",
        };
        write!(f, "{}", s)
    }
}
