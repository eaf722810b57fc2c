//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_events::{BatchAck, EscalationDecision, EscalationRequest, RecordBatch};
use fleet_hub::{CentralConfig, CentralHub};
use fleet_orchestrator::{HubError, HubTransport};

/// A Central Hub running in-process, which can be taken offline.
pub struct InProcessCentral {
    hub: Arc<CentralHub>,
    down: AtomicBool,
    batches: AtomicU32,
}

impl InProcessCentral {
    pub fn new() -> Self {
        Self::with_config(CentralConfig::default())
    }

    pub fn with_config(config: CentralConfig) -> Self {
        Self {
            hub: Arc::new(CentralHub::new(config)),
            down: AtomicBool::new(false),
            batches: AtomicU32::new(0),
        }
    }

    pub fn hub(&self) -> &Arc<CentralHub> {
        &self.hub
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Batches delivered while up.
    pub fn batches(&self) -> u32 {
        self.batches.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), HubError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(HubError::Unreachable {
                url: "in-process".to_string(),
                reason: "central is down".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HubTransport for InProcessCentral {
    async fn push_batch(&self, batch: &RecordBatch) -> Result<BatchAck, HubError> {
        self.check_up()?;
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.hub
            .ingest(batch.clone(), Utc::now())
            .map_err(|e| HubError::Rejected {
                status: 400,
                message: e.to_string(),
            })
    }

    async fn request_escalation(
        &self,
        request: &EscalationRequest,
    ) -> Result<EscalationDecision, HubError> {
        self.check_up()?;
        Ok(self.hub.decide_escalation(request, Utc::now()))
    }
}
