//! Configuration for the orchestrator.

use std::time::Duration;

use anyhow::Result;

use crate::health::HealthyTokens;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the fleet file.
    pub spec_path: String,

    /// Name of the host this orchestrator (and its edge hub) runs on.
    pub host: String,

    /// Central hub base URL.
    pub central_url: String,

    /// Steady-state probe interval in seconds.
    pub probe_interval_secs: u64,

    /// Per-probe timeout in milliseconds.
    pub probe_timeout_ms: u64,

    /// Time a launch wave may take to become healthy, in seconds.
    pub wave_timeout_secs: u64,

    /// Probe interval while an agent is starting, in milliseconds.
    pub startup_probe_interval_ms: u64,

    /// Status tokens accepted as healthy.
    pub healthy_tokens: HealthyTokens,

    /// How long the edge hub keeps records, in seconds.
    pub edge_retention_secs: u64,

    /// Maximum number of records the edge hub buffers.
    pub edge_capacity: usize,

    /// How long Central may be unreachable before the edge fails over, in seconds.
    pub central_grace_secs: u64,

    /// Edge-to-Central forward interval in seconds.
    pub forward_interval_secs: u64,

    /// Per-subscriber capacity of the error bus.
    pub bus_capacity: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spec_path: "fleet.toml".to_string(),
            host: "localhost".to_string(),
            central_url: "http://127.0.0.1:7400".to_string(),
            probe_interval_secs: 30,
            probe_timeout_ms: 5_000,
            wave_timeout_secs: 60,
            startup_probe_interval_ms: 500,
            healthy_tokens: HealthyTokens::default(),
            edge_retention_secs: 300,
            edge_capacity: 10_000,
            central_grace_secs: 15,
            forward_interval_secs: 5,
            bus_capacity: 1_024,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let spec_path = std::env::var("FLEET_SPEC_PATH").unwrap_or(defaults.spec_path);
        let host = std::env::var("FLEET_HOST").unwrap_or(defaults.host);
        let central_url = std::env::var("FLEET_CENTRAL_URL").unwrap_or(defaults.central_url);

        let healthy_tokens = std::env::var("FLEET_HEALTHY_TOKENS")
            .ok()
            .map(|s| HealthyTokens::from_csv(&s))
            .filter(|t| !t.is_empty())
            .unwrap_or(defaults.healthy_tokens);

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            spec_path,
            host,
            central_url,
            probe_interval_secs: env_or("FLEET_PROBE_INTERVAL_SECS", defaults.probe_interval_secs),
            probe_timeout_ms: env_or("FLEET_PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
            wave_timeout_secs: env_or("FLEET_WAVE_TIMEOUT_SECS", defaults.wave_timeout_secs),
            startup_probe_interval_ms: env_or(
                "FLEET_STARTUP_PROBE_INTERVAL_MS",
                defaults.startup_probe_interval_ms,
            ),
            healthy_tokens,
            edge_retention_secs: env_or("FLEET_EDGE_RETENTION_SECS", defaults.edge_retention_secs),
            edge_capacity: env_or("FLEET_EDGE_CAPACITY", defaults.edge_capacity),
            central_grace_secs: env_or("FLEET_CENTRAL_GRACE_SECS", defaults.central_grace_secs),
            forward_interval_secs: env_or(
                "FLEET_FORWARD_INTERVAL_SECS",
                defaults.forward_interval_secs,
            ),
            bus_capacity: env_or("FLEET_BUS_CAPACITY", defaults.bus_capacity),
            log_level,
        })
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn wave_timeout(&self) -> Duration {
        Duration::from_secs(self.wave_timeout_secs)
    }

    pub fn startup_probe_interval(&self) -> Duration {
        Duration::from_millis(self.startup_probe_interval_ms)
    }

    pub fn edge_retention(&self) -> Duration {
        Duration::from_secs(self.edge_retention_secs)
    }

    pub fn central_grace(&self) -> Duration {
        Duration::from_secs(self.central_grace_secs)
    }

    pub fn forward_interval(&self) -> Duration {
        Duration::from_secs(self.forward_interval_secs)
    }
}

/// Parse `key` from the environment, falling back to `default` when unset or invalid.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.edge_retention(), Duration::from_secs(300));
        assert!(config.healthy_tokens.is_healthy("OK"));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("FLEET_TEST_UNSET_VARIABLE", 7u64), 7);
    }
}
