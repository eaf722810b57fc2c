use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::central::CentralConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub edge_grace: Duration,
    pub expected_hosts: BTreeSet<String>,
    pub system_wide_cooldown: Duration,
    pub record_retention: Duration,
    pub alert_interval: Duration,
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("{} must be a number of seconds, got '{}'", name, v)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLEET_HUB_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7400".to_string())
            .parse()
            .context("FLEET_HUB_LISTEN_ADDR is not a socket address")?;

        let log_level = std::env::var("FLEET_HUB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let expected_hosts = std::env::var("FLEET_HUB_EXPECTED_HOSTS")
            .map(|v| parse_hosts(&v))
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            log_level,
            edge_grace: secs_var("FLEET_HUB_EDGE_GRACE_SECS", 30)?,
            expected_hosts,
            system_wide_cooldown: secs_var("FLEET_HUB_SYSTEM_WIDE_COOLDOWN_SECS", 120)?,
            record_retention: secs_var("FLEET_HUB_RECORD_RETENTION_SECS", 900)?,
            alert_interval: secs_var("FLEET_HUB_ALERT_INTERVAL_SECS", 5)?,
        })
    }

    pub fn central(&self) -> CentralConfig {
        CentralConfig {
            edge_grace: self.edge_grace,
            expected_hosts: self.expected_hosts.clone(),
            system_wide_cooldown: self.system_wide_cooldown,
            record_retention: self.record_retention,
        }
    }
}

fn parse_hosts(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts() {
        let hosts = parse_hosts(" host-a, host-b,,host-a ");
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains("host-b"));
    }
}
