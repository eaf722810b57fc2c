//! Edge hub.
//!
//! Buffers this host's health records and forwards them to the Central Hub
//! on a fixed cadence. The buffer is a bounded queue: records older than
//! the retention window expire, and when it is full the oldest record is
//! dropped.
//!
//! If Central stays unreachable for longer than the grace period the edge
//! fails over: it keeps buffering, keeps recovering locally (fleet-wide
//! restarts are refused while Central is gone), and once Central answers
//! again it replays the whole buffer with every record tagged `replayed`.
//! Central deduplicates by record ID.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{
    BatchAck, ErrorEvent, EscalationDecision, EscalationRequest, FleetErrorKind, HubRecord,
    OutageWindow, RecordBatch, Severity, SyncState,
};
use fleet_id::RecordId;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::ErrorBus;
use crate::config::Config;
use crate::recovery::EscalationAuthority;

/// Component name used as the source of edge hub events.
pub const EDGE_SOURCE: &str = "edge-hub";

/// Edge hub settings.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Host the records originate from.
    pub host: String,
    pub retention: Duration,
    pub capacity: usize,
    /// How long Central may be unreachable before failing over.
    pub central_grace: Duration,
    pub forward_interval: Duration,
    /// Largest incremental batch. Replays send the whole buffer.
    pub max_batch: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            retention: Duration::from_secs(300),
            capacity: 10_000,
            central_grace: Duration::from_secs(15),
            forward_interval: Duration::from_secs(5),
            max_batch: 500,
        }
    }
}

impl From<&Config> for EdgeConfig {
    fn from(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            retention: config.edge_retention(),
            capacity: config.edge_capacity,
            central_grace: config.central_grace(),
            forward_interval: config.forward_interval(),
            ..Default::default()
        }
    }
}

/// Errors talking to the Central Hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("central hub unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("central hub rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Connection from an edge to the Central Hub.
#[async_trait]
pub trait HubTransport: Send + Sync {
    async fn push_batch(&self, batch: &RecordBatch) -> Result<BatchAck, HubError>;

    async fn request_escalation(
        &self,
        request: &EscalationRequest,
    ) -> Result<EscalationDecision, HubError>;
}

/// Result of one forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to send.
    Idle,
    Forwarded { sent: usize, acknowledged: usize },
    /// The whole buffer was replayed after a failover.
    Replayed { sent: usize, acknowledged: usize },
    Failed { failover: bool },
    /// Central answered but refused the batch. The records stay buffered
    /// and the link state is unchanged.
    Rejected { status: u16 },
}

/// Point-in-time view of the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeStatus {
    pub buffered: usize,
    pub unacknowledged: usize,
    pub dropped: u64,
    pub expired: u64,
    pub central_reachable: bool,
    pub failover: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Buffer {
    records: VecDeque<HubRecord>,
    dropped: u64,
    expired: u64,
}

impl Buffer {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        let before = self.records.len();
        self.records.retain(|r| r.observed_at >= cutoff);
        self.expired += (before - self.records.len()) as u64;
    }

    fn set_state(&mut self, ids: &HashSet<RecordId>, from: Option<SyncState>, to: SyncState) {
        for record in self.records.iter_mut().filter(|r| ids.contains(&r.record_id)) {
            if from.is_none_or(|s| record.sync_state == s) {
                record.sync_state = to;
            }
        }
    }
}

#[derive(Debug)]
struct Link {
    reachable: bool,
    last_sync: Option<DateTime<Utc>>,
    outage_since: Option<DateTime<Utc>>,
    failover: bool,
}

/// This host's observability hub.
pub struct EdgeHub {
    config: EdgeConfig,
    transport: Arc<dyn HubTransport>,
    bus: ErrorBus,
    buffer: Mutex<Buffer>,
    link: Mutex<Link>,
}

impl EdgeHub {
    pub fn new(config: EdgeConfig, transport: Arc<dyn HubTransport>, bus: ErrorBus) -> Self {
        Self {
            config,
            transport,
            bus,
            buffer: Mutex::new(Buffer::default()),
            link: Mutex::new(Link {
                reachable: true,
                last_sync: None,
                outage_since: None,
                failover: false,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Buffer a record for forwarding.
    pub fn record(&self, mut record: HubRecord) {
        record.sync_state = SyncState::Local;
        let cutoff = self.cutoff(Utc::now());
        let mut buffer = self.lock_buffer();
        buffer.prune(cutoff);
        if buffer.records.len() >= self.config.capacity.max(1) {
            buffer.records.pop_front();
            buffer.dropped += 1;
            debug!(dropped = buffer.dropped, "Edge buffer full, dropped oldest record");
        }
        buffer.records.push_back(record);
    }

    /// Copy of the buffered records, oldest first.
    pub fn buffered(&self) -> Vec<HubRecord> {
        self.lock_buffer().records.iter().cloned().collect()
    }

    pub fn status(&self) -> EdgeStatus {
        let (buffered, unacknowledged, dropped, expired) = {
            let buffer = self.lock_buffer();
            let unacked = buffer
                .records
                .iter()
                .filter(|r| r.sync_state != SyncState::Acknowledged)
                .count();
            (buffer.records.len(), unacked, buffer.dropped, buffer.expired)
        };
        let link = self.lock_link();
        EdgeStatus {
            buffered,
            unacknowledged,
            dropped,
            expired,
            central_reachable: link.reachable,
            failover: link.failover,
            last_sync: link.last_sync,
        }
    }

    pub fn central_reachable(&self) -> bool {
        self.lock_link().reachable
    }

    pub fn in_failover(&self) -> bool {
        self.lock_link().failover
    }

    /// Forward pending records, or replay the buffer after a failover.
    pub async fn sync_once(&self) -> SyncOutcome {
        let now = Utc::now();
        let (replay, outage) = {
            let link = self.lock_link();
            let outage = link.outage_since.map(|since| OutageWindow { since, until: now });
            (link.failover, outage)
        };

        let batch = {
            let mut buffer = self.lock_buffer();
            buffer.prune(self.cutoff(now));
            let records: Vec<HubRecord> = if replay {
                buffer
                    .records
                    .iter_mut()
                    .map(|r| {
                        r.replayed = true;
                        if r.sync_state == SyncState::Local {
                            r.sync_state = SyncState::Forwarded;
                        }
                        r.clone()
                    })
                    .collect()
            } else {
                buffer
                    .records
                    .iter_mut()
                    .filter(|r| r.sync_state == SyncState::Local)
                    .take(self.config.max_batch.max(1))
                    .map(|r| {
                        r.sync_state = SyncState::Forwarded;
                        r.clone()
                    })
                    .collect()
            };
            RecordBatch {
                origin_host: self.config.host.clone(),
                sent_at: now,
                records,
                replay,
                central_outage: if replay { outage } else { None },
            }
        };

        if batch.records.is_empty() && !replay {
            return SyncOutcome::Idle;
        }
        let sent_ids: HashSet<RecordId> = batch.records.iter().map(|r| r.record_id).collect();

        match self.transport.push_batch(&batch).await {
            Ok(ack) => {
                let acked: HashSet<RecordId> = ack.acknowledged().copied().collect();
                let unacked: HashSet<RecordId> = sent_ids.difference(&acked).copied().collect();
                {
                    let mut buffer = self.lock_buffer();
                    buffer.set_state(&acked, None, SyncState::Acknowledged);
                    buffer.set_state(&unacked, Some(SyncState::Forwarded), SyncState::Local);
                }
                self.on_success(now, replay);

                let sent = batch.records.len();
                let acknowledged = acked.len();
                if replay {
                    info!(
                        sent,
                        accepted = ack.accepted.len(),
                        duplicates = ack.duplicates.len(),
                        "Replayed edge buffer to central hub"
                    );
                    SyncOutcome::Replayed { sent, acknowledged }
                } else {
                    debug!(sent, acknowledged, "Forwarded records to central hub");
                    SyncOutcome::Forwarded { sent, acknowledged }
                }
            }
            Err(e) => {
                self.lock_buffer()
                    .set_state(&sent_ids, Some(SyncState::Forwarded), SyncState::Local);
                if let HubError::Rejected { status, .. } = &e {
                    error!(
                        error = %e,
                        records = sent_ids.len(),
                        "Central hub rejected record batch"
                    );
                    return SyncOutcome::Rejected { status: *status };
                }
                let failover = self.on_failure(now, &e);
                SyncOutcome::Failed { failover }
            }
        }
    }

    /// Forward on a fixed interval until shutdown, then flush once more.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            host = %self.config.host,
            interval_secs = self.config.forward_interval.as_secs(),
            "Starting edge hub"
        );
        let mut interval = tokio::time::interval(self.config.forward_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sync_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let SyncOutcome::Failed { .. } | SyncOutcome::Rejected { .. } = self.sync_once().await {
            warn!(
                unacknowledged = self.status().unacknowledged,
                "Edge hub stopped with records central never acknowledged"
            );
        }
        info!("Edge hub shutting down");
    }

    fn on_success(&self, now: DateTime<Utc>, replayed: bool) {
        let mut link = self.lock_link();
        if !link.reachable {
            info!(replayed, "Central hub reachable again");
        }
        link.reachable = true;
        link.last_sync = Some(now);
        link.outage_since = None;
        link.failover = false;
    }

    /// Returns whether the edge is in failover after this failure.
    fn on_failure(&self, now: DateTime<Utc>, error: &HubError) -> bool {
        let (entered, since) = {
            let mut link = self.lock_link();
            link.reachable = false;
            let since = *link.outage_since.get_or_insert(now);
            let outage = (now - since).to_std().unwrap_or_default();
            let entered = !link.failover && outage >= self.config.central_grace;
            if entered {
                link.failover = true;
            }
            (entered, since)
        };

        if entered {
            error!(
                error = %error,
                since = %since,
                "Central hub unreachable, edge hub failing over"
            );
            self.bus.publish(
                ErrorEvent::new(
                    Severity::Error,
                    EDGE_SOURCE,
                    format!("central hub unreachable since {}", since),
                )
                .with_kind(FleetErrorKind::HubUnreachable)
                .with_context("host", &self.config.host)
                .with_context("error", error),
            );
        } else {
            warn!(error = %error, "Failed to forward records to central hub");
        }
        self.lock_link().failover
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fleet-wide restarts need Central's approval; while Central is
/// unreachable the edge refuses them.
#[async_trait]
impl EscalationAuthority for EdgeHub {
    async fn authorize(&self, request: &EscalationRequest) -> EscalationDecision {
        if !self.central_reachable() {
            return EscalationDecision {
                approved: false,
                reason: "central hub unreachable".to_string(),
            };
        }
        match self.transport.request_escalation(request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, agent = %request.agent_name, "Escalation request failed");
                EscalationDecision {
                    approved: false,
                    reason: format!("central hub unreachable: {}", e),
                }
            }
        }
    }
}
