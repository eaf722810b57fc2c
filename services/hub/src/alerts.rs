//! Alert watcher.
//!
//! Periodically evaluates cross-host alerts and logs each one when it opens
//! and when it clears.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{HubAlert, HubAlertKind};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::central::CentralHub;

/// Transitions found by one evaluation.
#[derive(Debug, Default, PartialEq)]
pub struct AlertChanges {
    pub opened: Vec<HubAlert>,
    pub cleared: Vec<String>,
}

pub struct AlertWorker {
    hub: Arc<CentralHub>,
    interval: Duration,
    open: BTreeMap<String, HubAlertKind>,
}

impl AlertWorker {
    pub fn new(hub: Arc<CentralHub>, interval: Duration) -> Self {
        Self {
            hub,
            interval,
            open: BTreeMap::new(),
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting alert worker");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evaluate(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Alert worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Compare current alerts against the ones already reported.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> AlertChanges {
        let current = self.hub.alerts(now);
        let mut changes = AlertChanges::default();

        for alert in &current {
            if self.open.get(&alert.host) == Some(&alert.kind) {
                continue;
            }
            match alert.kind {
                HubAlertKind::BothHubsDown => error!(
                    host = %alert.host,
                    last_seen = ?alert.last_seen,
                    "Edge and central hub were both down for host"
                ),
                HubAlertKind::EdgeDown => warn!(
                    host = %alert.host,
                    last_seen = ?alert.last_seen,
                    "Edge hub stopped reporting"
                ),
            }
            self.open.insert(alert.host.clone(), alert.kind);
            changes.opened.push(alert.clone());
        }

        let cleared: Vec<String> = self
            .open
            .keys()
            .filter(|host| !current.iter().any(|a| &a.host == *host))
            .cloned()
            .collect();
        for host in cleared {
            info!(host = %host, "Edge hub reporting again");
            self.open.remove(&host);
            changes.cleared.push(host);
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::CentralConfig;
    use fleet_events::RecordBatch;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn heartbeat(host: &str) -> RecordBatch {
        RecordBatch {
            origin_host: host.to_string(),
            sent_at: Utc::now(),
            records: Vec::new(),
            replay: false,
            central_outage: None,
        }
    }

    #[test]
    fn test_alert_opens_once_and_clears() {
        let hub = Arc::new(CentralHub::started_at(CentralConfig::default(), at(0)));
        hub.ingest(heartbeat("host-a"), at(1)).unwrap();
        let mut worker = AlertWorker::new(Arc::clone(&hub), Duration::from_secs(5));

        assert_eq!(worker.evaluate(at(10)), AlertChanges::default());

        let changes = worker.evaluate(at(40));
        assert_eq!(changes.opened.len(), 1);
        assert_eq!(changes.opened[0].kind, HubAlertKind::EdgeDown);

        // Still down: nothing new to report.
        assert!(worker.evaluate(at(45)).opened.is_empty());

        hub.ingest(heartbeat("host-a"), at(50)).unwrap();
        let changes = worker.evaluate(at(51));
        assert_eq!(changes.cleared, vec!["host-a".to_string()]);
    }
}
