//! Central Hub aggregation core.
//!
//! Merges record batches from every edge hub, keeps the latest health view
//! per agent, tracks when each host last reported, and decides fleet-wide
//! restart requests.
//!
//! Records are deduplicated by [`RecordId`]: an edge replaying its buffer
//! after an outage gets every record it already delivered back as a
//! duplicate, and nothing is stored twice.
//!
//! All methods take `now` explicitly so callers (and tests) control time.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{
    AgentHealthView, AggregateHealth, BatchAck, EscalationDecision, EscalationRequest,
    HostHubStatus, HubAlert, HubAlertKind, HubLinkState, HubRecord, OutageWindow, RecordBatch,
    SyncState,
};
use fleet_id::RecordId;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outage reports kept for alert correlation.
const MAX_OUTAGES: usize = 32;

/// Aggregation settings.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Silence after which an edge counts as down.
    pub edge_grace: Duration,
    /// Hosts expected to report, whether or not they have yet.
    pub expected_hosts: BTreeSet<String>,
    /// Minimum spacing between approved fleet-wide restarts.
    pub system_wide_cooldown: Duration,
    /// How long records are kept for deduplication.
    pub record_retention: Duration,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            edge_grace: Duration::from_secs(30),
            expected_hosts: BTreeSet::new(),
            system_wide_cooldown: Duration::from_secs(120),
            record_retention: Duration::from_secs(900),
        }
    }
}

/// Rejected record batches.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("batch has no origin host")]
    MissingOrigin,

    #[error("record {record} originates from '{found}', batch from '{expected}'")]
    OriginMismatch {
        record: RecordId,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Default)]
struct HostStats {
    last_seen: Option<DateTime<Utc>>,
    records_received: u64,
    replayed_records: u64,
}

#[derive(Debug)]
struct Inner {
    records: HashMap<RecordId, HubRecord>,
    /// Arrival order, for retention.
    arrivals: VecDeque<(DateTime<Utc>, RecordId)>,
    latest: BTreeMap<String, AgentHealthView>,
    hosts: BTreeMap<String, HostStats>,
    outages: VecDeque<(String, OutageWindow)>,
    last_sync: Option<DateTime<Utc>>,
    last_system_wide: Option<DateTime<Utc>>,
}

/// The authoritative, cross-host view of fleet health.
pub struct CentralHub {
    config: CentralConfig,
    started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl CentralHub {
    pub fn new(config: CentralConfig) -> Self {
        Self::started_at(config, Utc::now())
    }

    /// A hub that considers itself started at `started_at`.
    pub fn started_at(config: CentralConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            config,
            started_at,
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                arrivals: VecDeque::new(),
                latest: BTreeMap::new(),
                hosts: BTreeMap::new(),
                outages: VecDeque::new(),
                last_sync: None,
                last_system_wide: None,
            }),
        }
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Merge a batch from an edge.
    pub fn ingest(&self, batch: RecordBatch, now: DateTime<Utc>) -> Result<BatchAck, IngestError> {
        if batch.origin_host.trim().is_empty() {
            return Err(IngestError::MissingOrigin);
        }
        if let Some(stray) = batch
            .records
            .iter()
            .find(|r| r.origin_host != batch.origin_host)
        {
            return Err(IngestError::OriginMismatch {
                record: stray.record_id,
                expected: batch.origin_host.clone(),
                found: stray.origin_host.clone(),
            });
        }

        let mut inner = self.lock();
        self.prune(&mut inner, now);

        let mut ack = BatchAck::default();
        let mut replayed = 0u64;
        for mut record in batch.records {
            let id = record.record_id;
            if inner.records.contains_key(&id) {
                ack.duplicates.push(id);
                continue;
            }
            if record.replayed {
                replayed += 1;
            }
            record.sync_state = SyncState::Acknowledged;

            let newer = inner
                .latest
                .get(&record.agent_name)
                .is_none_or(|view| record.observed_at > view.observed_at);
            if newer {
                inner.latest.insert(
                    record.agent_name.clone(),
                    AgentHealthView {
                        agent_name: record.agent_name.clone(),
                        origin_host: record.origin_host.clone(),
                        status: record.status,
                        observed_at: record.observed_at,
                        latency_ms: record.latency_ms,
                    },
                );
            }
            inner.arrivals.push_back((now, id));
            inner.records.insert(id, record);
            ack.accepted.push(id);
        }

        let stats = inner.hosts.entry(batch.origin_host.clone()).or_default();
        stats.last_seen = Some(now);
        stats.records_received += ack.accepted.len() as u64;
        stats.replayed_records += replayed;

        if let Some(window) = batch.central_outage {
            info!(
                host = %batch.origin_host,
                since = %window.since,
                until = %window.until,
                "Edge reported central outage"
            );
            if inner.outages.len() == MAX_OUTAGES {
                inner.outages.pop_front();
            }
            inner.outages.push_back((batch.origin_host.clone(), window));
        }
        inner.last_sync = Some(now);

        debug!(
            host = %batch.origin_host,
            accepted = ack.accepted.len(),
            duplicates = ack.duplicates.len(),
            replay = batch.replay,
            "Ingested record batch"
        );
        Ok(ack)
    }

    /// Number of distinct records held.
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Aggregate health as of `now`.
    pub fn aggregate(&self, now: DateTime<Utc>) -> AggregateHealth {
        let inner = self.lock();
        let grace = to_chrono(self.config.edge_grace);

        let hosts = self
            .known_hosts(&inner)
            .into_iter()
            .map(|host| {
                let stats = inner.hosts.get(&host);
                let last_seen = stats.and_then(|s| s.last_seen);
                let up = last_seen.is_some_and(|seen| now - seen <= grace);
                HostHubStatus {
                    host,
                    state: if up { HubLinkState::Up } else { HubLinkState::Down },
                    last_seen,
                    records_received: stats.map(|s| s.records_received).unwrap_or(0),
                    replayed_records: stats.map(|s| s.replayed_records).unwrap_or(0),
                }
            })
            .collect();

        AggregateHealth {
            generated_at: now,
            agents: inner.latest.values().cloned().collect(),
            hosts,
            last_sync: inner.last_sync,
            alerts: self.alerts_locked(&inner, now),
        }
    }

    /// Alerts for hosts that stopped reporting.
    ///
    /// A host is silent once it has not reported for longer than the edge
    /// grace period (counting from hub start if it never reported). If its
    /// silence overlaps a Central outage, either one an edge reported or
    /// this hub's own restart, both hubs were down for it and the alert is
    /// [`HubAlertKind::BothHubsDown`]; otherwise it is
    /// [`HubAlertKind::EdgeDown`].
    pub fn alerts(&self, now: DateTime<Utc>) -> Vec<HubAlert> {
        let inner = self.lock();
        self.alerts_locked(&inner, now)
    }

    fn alerts_locked(&self, inner: &Inner, now: DateTime<Utc>) -> Vec<HubAlert> {
        let grace = to_chrono(self.config.edge_grace);
        let mut alerts = Vec::new();

        for host in self.known_hosts(inner) {
            let last_seen = inner.hosts.get(&host).and_then(|s| s.last_seen);
            let silent_since = last_seen.unwrap_or(self.started_at);
            if now - silent_since <= grace {
                continue;
            }

            // Never heard from since this hub started: the hub itself was
            // down when the edge last reported.
            let central_down = last_seen.is_none()
                || inner
                    .outages
                    .iter()
                    .any(|(_, window)| window.until >= silent_since);
            let kind = if central_down {
                HubAlertKind::BothHubsDown
            } else {
                HubAlertKind::EdgeDown
            };
            alerts.push(HubAlert {
                kind,
                severity: kind.severity(),
                host,
                last_seen,
            });
        }
        alerts
    }

    /// Approve or refuse a fleet-wide restart. At most one is approved per
    /// cooldown window, across all hosts.
    pub fn decide_escalation(
        &self,
        request: &EscalationRequest,
        now: DateTime<Utc>,
    ) -> EscalationDecision {
        let mut inner = self.lock();
        let cooldown = to_chrono(self.config.system_wide_cooldown);

        if let Some(last) = inner.last_system_wide {
            if now - last < cooldown {
                warn!(
                    host = %request.origin_host,
                    agent = %request.agent_name,
                    last_approved = %last,
                    "Refusing fleet-wide restart inside cooldown"
                );
                return EscalationDecision {
                    approved: false,
                    reason: format!("a fleet-wide restart was already approved at {}", last),
                };
            }
        }

        inner.last_system_wide = Some(now);
        info!(
            host = %request.origin_host,
            agent = %request.agent_name,
            group = %request.group,
            "Approved fleet-wide restart"
        );
        EscalationDecision {
            approved: true,
            reason: "approved by central hub".to_string(),
        }
    }

    fn known_hosts(&self, inner: &Inner) -> BTreeSet<String> {
        self.config
            .expected_hosts
            .iter()
            .cloned()
            .chain(inner.hosts.keys().cloned())
            .collect()
    }

    fn prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let cutoff = now - to_chrono(self.config.record_retention);
        while let Some(&(arrived, id)) = inner.arrivals.front() {
            if arrived >= cutoff {
                break;
            }
            inner.arrivals.pop_front();
            inner.records.remove(&id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CentralHub {
    fn default() -> Self {
        Self::new(CentralConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_events::AgentStatus;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(host: &str, agent: &str, status: AgentStatus, observed: i64) -> HubRecord {
        let mut r = HubRecord::new(host, agent, status);
        r.observed_at = at(observed);
        r
    }

    fn batch(host: &str, records: Vec<HubRecord>) -> RecordBatch {
        RecordBatch {
            origin_host: host.to_string(),
            sent_at: Utc::now(),
            records,
            replay: false,
            central_outage: None,
        }
    }

    fn hub(expected: &[&str]) -> CentralHub {
        CentralHub::started_at(
            CentralConfig {
                expected_hosts: expected.iter().map(|h| h.to_string()).collect(),
                ..Default::default()
            },
            at(0),
        )
    }

    #[test]
    fn test_replayed_records_are_deduplicated() {
        let hub = hub(&[]);
        let a = record("host-a", "asr", AgentStatus::Healthy, 1);
        let b = record("host-a", "tts", AgentStatus::Healthy, 2);

        let ack = hub.ingest(batch("host-a", vec![a.clone()]), at(3)).unwrap();
        assert_eq!(ack.accepted, vec![a.record_id]);

        let mut replay = batch("host-a", vec![a.clone(), b.clone()]);
        replay.replay = true;
        let ack = hub.ingest(replay, at(4)).unwrap();
        assert_eq!(ack.accepted, vec![b.record_id]);
        assert_eq!(ack.duplicates, vec![a.record_id]);
        assert_eq!(hub.record_count(), 2);
    }

    #[test]
    fn test_latest_view_ignores_older_records() {
        let hub = hub(&[]);
        hub.ingest(
            batch("host-a", vec![record("host-a", "asr", AgentStatus::Unreachable, 10)]),
            at(11),
        )
        .unwrap();
        hub.ingest(
            batch("host-a", vec![record("host-a", "asr", AgentStatus::Healthy, 5)]),
            at(12),
        )
        .unwrap();

        let health = hub.aggregate(at(12));
        assert_eq!(health.agents.len(), 1);
        assert_eq!(health.agents[0].status, AgentStatus::Unreachable);
        assert_eq!(health.last_sync, Some(at(12)));
    }

    #[test]
    fn test_rejects_foreign_records() {
        let hub = hub(&[]);
        let err = hub
            .ingest(
                batch("host-a", vec![record("host-b", "asr", AgentStatus::Healthy, 1)]),
                at(2),
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::OriginMismatch { .. }));
        assert_eq!(hub.ingest(batch(" ", vec![]), at(2)), Err(IngestError::MissingOrigin));
    }

    #[test]
    fn test_silent_edge_is_edge_down() {
        let hub = hub(&["host-a", "host-b"]);
        hub.ingest(batch("host-a", vec![]), at(10)).unwrap();
        hub.ingest(batch("host-b", vec![]), at(10)).unwrap();
        hub.ingest(batch("host-a", vec![]), at(50)).unwrap();

        let alerts = hub.alerts(at(50));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].host, "host-b");
        assert_eq!(alerts[0].kind, HubAlertKind::EdgeDown);
        assert_eq!(alerts[0].severity, fleet_events::Severity::Error);

        let health = hub.aggregate(at(50));
        let b = health.hosts.iter().find(|h| h.host == "host-b").unwrap();
        assert_eq!(b.state, HubLinkState::Down);
    }

    #[test]
    fn test_silence_during_central_outage_is_both_down() {
        let hub = hub(&["host-a", "host-b"]);
        hub.ingest(batch("host-a", vec![]), at(10)).unwrap();
        hub.ingest(batch("host-b", vec![]), at(10)).unwrap();

        // host-a reports that central was unreachable from 20s to 60s;
        // host-b went quiet at 10s and never came back.
        let mut replay = batch("host-a", vec![]);
        replay.replay = true;
        replay.central_outage = Some(OutageWindow {
            since: at(20),
            until: at(60),
        });
        hub.ingest(replay, at(60)).unwrap();

        let alerts = hub.alerts(at(61));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, HubAlertKind::BothHubsDown);
        assert_eq!(alerts[0].severity, fleet_events::Severity::Critical);
    }

    #[test]
    fn test_expected_host_never_seen_after_restart() {
        let hub = hub(&["host-a"]);
        assert!(hub.alerts(at(5)).is_empty());
        let alerts = hub.alerts(at(31));
        assert_eq!(alerts[0].kind, HubAlertKind::BothHubsDown);
        assert_eq!(alerts[0].last_seen, None);
    }

    #[test]
    fn test_system_wide_cooldown() {
        let hub = hub(&[]);
        let request = EscalationRequest {
            origin_host: "host-a".to_string(),
            agent_name: "asr".to_string(),
            group: "speech".to_string(),
            reason: "test".to_string(),
        };
        assert!(hub.decide_escalation(&request, at(0)).approved);
        assert!(!hub.decide_escalation(&request, at(60)).approved);
        assert!(hub.decide_escalation(&request, at(121)).approved);
    }

    #[test]
    fn test_records_pruned_after_retention() {
        let hub = hub(&[]);
        hub.ingest(
            batch("host-a", vec![record("host-a", "asr", AgentStatus::Healthy, 0)]),
            at(0),
        )
        .unwrap();
        hub.ingest(batch("host-a", vec![]), at(1_000)).unwrap();
        assert_eq!(hub.record_count(), 0);
        // The latest view survives pruning.
        assert_eq!(hub.aggregate(at(1_000)).agents.len(), 1);
    }
}
