//! Central Hub API client for the edge hub.
//!
//! Provides methods for communicating with the Central Hub:
//! - Pushing record batches
//! - Requesting fleet-wide restart approval

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_events::{BatchAck, EscalationDecision, EscalationRequest, RecordBatch};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::edge::{HubError, HubTransport};

/// Central Hub API client.
pub struct CentralClient {
    client: reqwest::Client,
    base_url: String,
}

impl CentralClient {
    /// Create a new client for `config.central_url`.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base_url(&config.central_url, Duration::from_secs(10))
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, HubError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let unreachable = |e: reqwest::Error| HubError::Unreachable {
            url: url.clone(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            error!(status = %status, body = %message, url = %url, "Central hub rejected request");
            return Err(HubError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response.json().await.map_err(unreachable)
    }
}

#[async_trait]
impl HubTransport for CentralClient {
    async fn push_batch(&self, batch: &RecordBatch) -> Result<BatchAck, HubError> {
        debug!(
            records = batch.records.len(),
            replay = batch.replay,
            "Pushing record batch"
        );
        self.post("/v1/records", batch).await
    }

    async fn request_escalation(
        &self,
        request: &EscalationRequest,
    ) -> Result<EscalationDecision, HubError> {
        debug!(
            agent = %request.agent_name,
            group = %request.group,
            "Requesting fleet-wide restart"
        );
        self.post("/v1/escalations", request).await
    }
}
