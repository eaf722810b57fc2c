//! Declared fleet topology.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single agent as declared in the fleet file.
///
/// Specs are a read-only snapshot taken once per orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent name.
    pub name: String,

    /// Host the agent runs on.
    pub host: String,

    /// Service port.
    pub port: u16,

    /// Port of the health-check endpoint.
    pub health_port: u16,

    /// Names of agents this agent depends on.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Whether failure to become healthy blocks later waves.
    #[serde(default = "default_required")]
    pub required: bool,

    /// Recovery group.
    #[serde(default = "default_group")]
    pub group: String,

    /// Entry point argv. The first element is the executable.
    #[serde(default)]
    pub command: Vec<String>,

    /// Extra environment for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_required() -> bool {
    true
}

fn default_group() -> String {
    "default".to_string()
}

impl AgentSpec {
    /// Create a spec with no dependencies, `required = true` and the default group.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        health_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            health_port,
            dependencies: BTreeSet::new(),
            required: true,
            group: default_group(),
            command: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Add a dependency.
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    /// Set the recovery group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Mark the agent as optional (does not block wave progression).
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set the entry point argv.
    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    /// `host:health_port` address of the health endpoint.
    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.host, self.health_port)
    }
}

/// Scope of a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    /// Restart only the failed agent.
    #[default]
    RestartProcess,
    /// Restart every agent sharing the failed agent's group.
    RestartGroup,
    /// Restart the whole fleet from the last successful wave boundary.
    SystemWide,
}

impl std::fmt::Display for EscalationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationTier::RestartProcess => "restart_process",
            EscalationTier::RestartGroup => "restart_group",
            EscalationTier::SystemWide => "system_wide",
        };
        write!(f, "{}", s)
    }
}

/// Restart and backoff policy bound to an agent or a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Consecutive probe failures tolerated before escalating. One more
    /// failure past this number exhausts recovery.
    pub max_retries: u32,

    /// Base restart delay in milliseconds.
    pub base_backoff_ms: u64,

    /// Growth factor applied per restart attempt.
    pub backoff_multiplier: f64,

    /// Upper bound on the restart delay in milliseconds.
    pub max_backoff_ms: u64,

    /// Scope of the restart once the threshold is reached.
    pub escalation_tier: EscalationTier,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            escalation_tier: EscalationTier::RestartProcess,
        }
    }
}

impl RecoveryPolicy {
    /// Base restart delay.
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Restart delay ceiling.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before restart attempt `attempt` (zero-based):
    /// `base_backoff * multiplier^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.base_backoff_ms as f64 * multiplier.powi(exponent);
        let capped = delay.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Fields a group or agent policy sets. Anything left out is inherited
/// from the next, broader level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_tier: Option<EscalationTier>,
}

impl PolicyOverride {
    /// Apply the fields this override sets on top of `base`.
    pub fn apply(&self, mut base: RecoveryPolicy) -> RecoveryPolicy {
        if let Some(v) = self.max_retries {
            base.max_retries = v;
        }
        if let Some(v) = self.base_backoff_ms {
            base.base_backoff_ms = v;
        }
        if let Some(v) = self.backoff_multiplier {
            base.backoff_multiplier = v;
        }
        if let Some(v) = self.max_backoff_ms {
            base.max_backoff_ms = v;
        }
        if let Some(v) = self.escalation_tier {
            base.escalation_tier = v;
        }
        base
    }
}

/// Recovery policies keyed by agent and group, with a fleet-wide default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    /// Fallback policy.
    pub default: RecoveryPolicy,

    /// Per-group overrides, layered on `default`.
    pub groups: BTreeMap<String, PolicyOverride>,

    /// Per-agent overrides, layered on the agent's group policy.
    pub agents: BTreeMap<String, PolicyOverride>,
}

impl PolicySet {
    /// Resolve the policy for an agent: default, then the group's fields,
    /// then the agent's own fields.
    pub fn resolve(&self, spec: &AgentSpec) -> RecoveryPolicy {
        let mut policy = self.default.clone();
        if let Some(group) = self.groups.get(&spec.group) {
            policy = group.apply(policy);
        }
        if let Some(agent) = self.agents.get(&spec.name) {
            policy = agent.apply(policy);
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_then_caps() {
        let policy = RecoveryPolicy {
            base_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
            ..Default::default()
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_multiplier_below_one_never_shrinks() {
        let policy = RecoveryPolicy {
            base_backoff_ms: 100,
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert_eq!(policy.backoff(5), Duration::from_millis(100));
    }

    #[test]
    fn test_policy_resolution_order() {
        let spec = AgentSpec::new("asr", "host-a", 9000, 9001).in_group("speech");
        let mut set = PolicySet::default();
        assert_eq!(set.resolve(&spec).max_retries, 3);

        set.groups.insert(
            "speech".to_string(),
            PolicyOverride {
                max_retries: Some(5),
                ..Default::default()
            },
        );
        assert_eq!(set.resolve(&spec).max_retries, 5);

        set.agents.insert(
            "asr".to_string(),
            PolicyOverride {
                max_retries: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(set.resolve(&spec).max_retries, 1);
    }

    #[test]
    fn test_omitted_fields_inherit_fleet_default() {
        let set: PolicySet = toml::from_str(
            r#"
            [default]
            max_retries = 7
            base_backoff_ms = 50

            [groups.speech]
            escalation_tier = "restart_group"

            [agents.asr]
            base_backoff_ms = 10
            "#,
        )
        .unwrap();

        let asr = AgentSpec::new("asr", "host-a", 9000, 9001).in_group("speech");
        let policy = set.resolve(&asr);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.escalation_tier, EscalationTier::RestartGroup);
        assert_eq!(policy.base_backoff_ms, 10);
        assert_eq!(policy.max_backoff_ms, 60_000);

        let tts = AgentSpec::new("tts", "host-a", 9010, 9011).in_group("speech");
        assert_eq!(set.resolve(&tts).base_backoff_ms, 50);
    }

    #[test]
    fn test_agent_spec_from_toml_defaults() {
        let spec: AgentSpec = toml::from_str(
            r#"
            name = "translator"
            host = "host-b"
            port = 7100
            health_port = 7101
            dependencies = ["asr"]
            command = ["./bin/translator", "--port", "7100"]
            "#,
        )
        .unwrap();

        assert!(spec.required);
        assert_eq!(spec.group, "default");
        assert!(spec.dependencies.contains("asr"));
        assert_eq!(spec.health_addr(), "host-b:7101");
    }

    #[test]
    fn test_escalation_tier_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            tier: EscalationTier,
        }
        let w: Wrapper = toml::from_str(r#"tier = "system_wide""#).unwrap();
        assert_eq!(w.tier, EscalationTier::SystemWide);
    }
}
