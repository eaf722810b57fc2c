//! Operator report.
//!
//! Summarizes every declared agent's terminal state after a launch (and
//! again at shutdown), and derives the process exit code: success only if
//! every required agent is healthy.

use chrono::{DateTime, Utc};
use fleet_events::{AgentStatus, AgentSpec};
use fleet_graph::DependencyGraph;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::state::{AgentRuntimeState, StateTable};

/// How an agent's run turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentOutcome {
    Healthy,
    NeverStarted,
    StartedNeverHealthy,
    RegressedAfterHealthy,
    Stopped,
    Failed,
}

impl AgentOutcome {
    pub fn of(state: &AgentRuntimeState) -> Self {
        match state.status {
            AgentStatus::Healthy => Self::Healthy,
            AgentStatus::Stopped => Self::Stopped,
            AgentStatus::Pending => Self::NeverStarted,
            AgentStatus::Failed if !state.ever_started => Self::NeverStarted,
            AgentStatus::Failed => Self::Failed,
            _ if state.ever_healthy => Self::RegressedAfterHealthy,
            _ if state.ever_started => Self::StartedNeverHealthy,
            _ => Self::NeverStarted,
        }
    }
}

impl std::fmt::Display for AgentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::NeverStarted => "never started",
            Self::StartedNeverHealthy => "started, never healthy",
            Self::RegressedAfterHealthy => "regressed after healthy",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One agent's line in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentReport {
    pub agent: String,
    pub host: String,
    pub group: String,
    pub required: bool,
    pub status: AgentStatus,
    pub outcome: AgentOutcome,
    pub restarts: u32,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
}

impl AgentReport {
    fn new(spec: &AgentSpec, state: &AgentRuntimeState) -> Self {
        Self {
            agent: spec.name.clone(),
            host: spec.host.clone(),
            group: spec.group.clone(),
            required: spec.required,
            status: state.status,
            outcome: AgentOutcome::of(state),
            restarts: state.restarts,
            exit_code: state.exit_code,
            last_error: state.last_error.clone(),
        }
    }
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Required")]
    required: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Restarts")]
    restarts: u32,
    #[tabled(rename = "Exit")]
    exit_code: String,
}

impl From<&AgentReport> for Row {
    fn from(r: &AgentReport) -> Self {
        Self {
            agent: r.agent.clone(),
            host: r.host.clone(),
            group: r.group.clone(),
            required: if r.required { "yes" } else { "no" }.to_string(),
            status: r.status.to_string(),
            outcome: r.outcome.to_string(),
            restarts: r.restarts,
            exit_code: r
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Terminal state of the whole fleet.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub generated_at: DateTime<Utc>,
    pub agents: Vec<AgentReport>,
}

impl LaunchReport {
    /// Build the report from live state and history, in launch order.
    pub async fn collect(graph: &DependencyGraph, table: &StateTable) -> Self {
        let mut agents = Vec::new();
        for wave in graph.waves().iter() {
            for name in wave {
                let Some(spec) = graph.spec(name) else {
                    continue;
                };
                let state = table
                    .last_known(name)
                    .await
                    .unwrap_or_else(|| AgentRuntimeState::new(name.clone()));
                agents.push(AgentReport::new(spec, &state));
            }
        }
        Self {
            generated_at: Utc::now(),
            agents,
        }
    }

    /// Required agents that are not healthy.
    pub fn unhealthy_required(&self) -> impl Iterator<Item = &AgentReport> {
        self.agents
            .iter()
            .filter(|a| a.required && a.status != AgentStatus::Healthy)
    }

    pub fn is_success(&self) -> bool {
        self.unhealthy_required().next().is_none()
    }

    /// Process exit code: 0 only if every required agent is healthy.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn render(&self) -> String {
        let rows: Vec<Row> = self.agents.iter().map(Row::from).collect();
        Table::new(rows).to_string()
    }
}

impl std::fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.render())?;
        let failing: Vec<String> = self
            .unhealthy_required()
            .map(|a| match &a.last_error {
                Some(err) => format!("{} ({}: {})", a.agent, a.outcome, err),
                None => format!("{} ({})", a.agent, a.outcome),
            })
            .collect();
        if failing.is_empty() {
            write!(f, "All required agents healthy.")
        } else {
            write!(f, "Required agents not healthy: {}", failing.join(", "))
        }
    }
}
