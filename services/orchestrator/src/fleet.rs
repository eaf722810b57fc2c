//! Fleet file loading.
//!
//! ```toml
//! [[agents]]
//! name = "asr"
//! host = "localhost"
//! port = 9000
//! health_port = 9001
//! dependencies = ["model-store"]
//! group = "speech"
//! command = ["./bin/asr", "--port", "9000"]
//!
//! [policies.default]
//! max_retries = 3
//!
//! [policies.groups.speech]
//! escalation_tier = "restart_group"
//! ```

use std::path::{Path, PathBuf};

use fleet_events::{AgentSpec, PolicySet, RecoveryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a fleet file.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read fleet file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid fleet file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("fleet file {path} declares no agents")]
    Empty { path: PathBuf },
}

/// The declared fleet: agent specs plus recovery policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,

    #[serde(default)]
    pub policies: PolicySet,
}

impl FleetFile {
    /// Load and parse a fleet file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let fleet = Self::parse(&text).map_err(|source| SpecError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if fleet.agents.is_empty() {
            return Err(SpecError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(fleet)
    }

    /// Parse fleet file text.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Policy that applies to `spec`.
    pub fn policy_for(&self, spec: &AgentSpec) -> RecoveryPolicy {
        self.policies.resolve(spec)
    }
}
