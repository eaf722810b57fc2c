//! Edge hub forwarding and failover against an in-process Central Hub.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::InProcessCentral;
use fleet_events::{AgentStatus, EscalationRequest, FleetErrorKind, HubRecord, Severity};
use fleet_orchestrator::edge::{EdgeConfig, SyncOutcome};
use fleet_orchestrator::recovery::EscalationAuthority;
use fleet_orchestrator::{EdgeHub, ErrorBus, EventFilter};

fn edge(central: &Arc<InProcessCentral>, bus: &ErrorBus) -> EdgeHub {
    EdgeHub::new(
        EdgeConfig {
            host: "host-a".to_string(),
            central_grace: Duration::ZERO,
            ..Default::default()
        },
        central.clone(),
        bus.clone(),
    )
}

fn record(agent: &str) -> HubRecord {
    HubRecord::new("host-a", agent, AgentStatus::Healthy)
}

#[tokio::test]
async fn replay_after_outage_loses_and_duplicates_nothing() {
    let central = Arc::new(InProcessCentral::new());
    let bus = ErrorBus::new(16);
    let mut events = bus.subscribe(EventFilter::min_severity(Severity::Error));
    let edge = edge(&central, &bus);

    let mut ids = HashSet::new();
    for agent in ["asr", "tts", "llm"] {
        let r = record(agent);
        ids.insert(r.record_id);
        edge.record(r);
    }
    assert_eq!(
        edge.sync_once().await,
        SyncOutcome::Forwarded {
            sent: 3,
            acknowledged: 3
        }
    );

    central.set_down(true);
    for agent in ["asr", "tts"] {
        let r = record(agent);
        ids.insert(r.record_id);
        edge.record(r);
    }
    assert_eq!(edge.sync_once().await, SyncOutcome::Failed { failover: true });
    assert!(edge.in_failover());

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind(), Some(FleetErrorKind::HubUnreachable.as_str()));

    // Recorded during failover, still buffered locally.
    let r = record("llm");
    ids.insert(r.record_id);
    edge.record(r);
    assert_eq!(edge.status().unacknowledged, 3);

    central.set_down(false);
    assert_eq!(
        edge.sync_once().await,
        SyncOutcome::Replayed {
            sent: 6,
            acknowledged: 6
        }
    );
    assert!(!edge.in_failover());
    assert_eq!(edge.status().unacknowledged, 0);

    // Central holds each record exactly once.
    assert_eq!(central.hub().record_count(), ids.len());
    let health = central.hub().aggregate(Utc::now());
    let host = &health.hosts[0];
    assert_eq!(host.records_received, 6);
    assert_eq!(host.replayed_records, 3);

    assert_eq!(edge.sync_once().await, SyncOutcome::Idle);
}

#[tokio::test]
async fn fleet_wide_restart_needs_reachable_central() {
    let central = Arc::new(InProcessCentral::new());
    let bus = ErrorBus::new(16);
    let edge = edge(&central, &bus);
    let request = EscalationRequest {
        origin_host: "host-a".to_string(),
        agent_name: "asr".to_string(),
        group: "speech".to_string(),
        reason: "retries exhausted".to_string(),
    };

    edge.record(record("asr"));
    edge.sync_once().await;
    assert!(edge.authorize(&request).await.approved);

    // A second request inside the cooldown is refused by Central.
    assert!(!edge.authorize(&request).await.approved);

    central.set_down(true);
    edge.record(record("asr"));
    edge.sync_once().await;
    let decision = edge.authorize(&request).await;
    assert!(!decision.approved);
    assert!(decision.reason.contains("unreachable"));
}
