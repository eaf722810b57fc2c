//! Health check client.
//!
//! Sends `{"action":"health_check"}` as one line of JSON to an agent's
//! health port and reads one line back. The whole exchange is bounded by
//! the probe timeout. The client never retries; deciding what a failure
//! means is the recovery engine's job.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use fleet_events::{
    AgentSpec, HealthProbeResult, HealthRequest, HealthResponse, ProbeClassification,
};
use fleet_id::BootId;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Default probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Longest response line accepted from an agent.
const MAX_RESPONSE_BYTES: u64 = 64 * 1024;

/// Status tokens accepted as healthy, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthyTokens(BTreeSet<String>);

impl HealthyTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    /// Parse a comma-separated token list.
    pub fn from_csv(s: &str) -> Self {
        Self::new(s.split(','))
    }

    pub fn is_healthy(&self, token: &str) -> bool {
        self.0.contains(&token.trim().to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for HealthyTokens {
    fn default() -> Self {
        Self::new(["ok", "healthy"])
    }
}

/// Probes an agent once.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `spec`. Never fails: every outcome is a classified result.
    async fn probe(&self, spec: &AgentSpec, boot_id: Option<BootId>) -> HealthProbeResult;
}

#[derive(Debug, Error)]
enum ExchangeError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before a response was received")]
    Closed,

    #[error("malformed response: {0}")]
    Malformed(#[from] fleet_events::EventError),
}

/// TCP health-check client.
#[derive(Debug, Clone)]
pub struct HealthCheckClient {
    timeout: Duration,
    tokens: HealthyTokens,
}

impl HealthCheckClient {
    pub fn new(timeout: Duration, tokens: HealthyTokens) -> Self {
        Self { timeout, tokens }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify a response the agent actually sent.
    pub fn classify(&self, response: &HealthResponse) -> ProbeClassification {
        if self.tokens.is_healthy(&response.status) {
            ProbeClassification::Healthy
        } else {
            ProbeClassification::Unhealthy
        }
    }

    /// Probe `addr` directly.
    pub async fn probe_addr(&self, agent: &str, addr: &str) -> HealthProbeResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, exchange(addr)).await;
        let latency = started.elapsed().min(self.timeout);

        let result = match outcome {
            Err(_) => HealthProbeResult::unreachable(
                agent,
                ProbeClassification::Timeout,
                self.timeout,
                format!("no response within {}ms", self.timeout.as_millis()),
            ),
            Ok(Err(e)) => HealthProbeResult::unreachable(
                agent,
                ProbeClassification::TransportFailure,
                latency,
                e.to_string(),
            ),
            Ok(Ok(response)) => {
                let classification = self.classify(&response);
                let mut payload = response.raw_payload.clone();
                payload.insert(
                    "status".to_string(),
                    serde_json::Value::String(response.status.clone()),
                );
                HealthProbeResult {
                    agent_name: agent.to_string(),
                    boot_id: None,
                    timestamp: Utc::now(),
                    round_trip_latency: latency,
                    classification,
                    status_token: Some(response.status),
                    raw_payload: Some(serde_json::Value::Object(payload)),
                    detail: None,
                }
            }
        };

        debug!(
            agent,
            addr,
            classification = %result.classification,
            latency_ms = result.latency_ms(),
            "Probe completed"
        );
        result
    }
}

impl Default for HealthCheckClient {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT, HealthyTokens::default())
    }
}

#[async_trait]
impl HealthProbe for HealthCheckClient {
    async fn probe(&self, spec: &AgentSpec, boot_id: Option<BootId>) -> HealthProbeResult {
        self.probe_addr(&spec.name, &spec.health_addr())
            .await
            .for_boot(boot_id)
    }
}

async fn exchange(addr: &str) -> Result<HealthResponse, ExchangeError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ExchangeError::Connect {
            addr: addr.to_string(),
            source,
        })?;

    let mut request = serde_json::to_vec(&HealthRequest::health_check())
        .map_err(fleet_events::EventError::from)?;
    request.push(b'\n');
    stream.write_all(&request).await?;
    stream.flush().await?;

    let (read, _write) = stream.split();
    let mut reader = BufReader::new(read).take(MAX_RESPONSE_BYTES);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(ExchangeError::Closed);
    }
    Ok(HealthResponse::from_line(&line)?)
}

/// Scripted probe for tests.
///
/// Each agent answers from its queue of scripted outcomes, then repeats its
/// fallback (healthy unless set otherwise).
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    inner: Mutex<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    queued: BTreeMap<String, VecDeque<ProbeClassification>>,
    fallback: BTreeMap<String, ProbeClassification>,
    calls: BTreeMap<String, u32>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for `agent`, answered in order.
    pub fn push(&self, agent: &str, outcomes: impl IntoIterator<Item = ProbeClassification>) {
        self.with_state(|s| s.queued.entry(agent.to_string()).or_default().extend(outcomes));
    }

    /// Outcome for `agent` once its queue is drained.
    pub fn set_fallback(&self, agent: &str, outcome: ProbeClassification) {
        self.with_state(|s| {
            s.fallback.insert(agent.to_string(), outcome);
        });
    }

    /// Number of probes `agent` received.
    pub fn calls(&self, agent: &str) -> u32 {
        self.with_state(|s| s.calls.get(agent).copied().unwrap_or(0))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, spec: &AgentSpec, boot_id: Option<BootId>) -> HealthProbeResult {
        let classification = self.with_state(|s| {
            *s.calls.entry(spec.name.clone()).or_default() += 1;
            s.queued
                .get_mut(&spec.name)
                .and_then(VecDeque::pop_front)
                .or_else(|| s.fallback.get(&spec.name).copied())
                .unwrap_or(ProbeClassification::Healthy)
        });

        let mut result = match classification {
            ProbeClassification::Healthy | ProbeClassification::Unhealthy => {
                let token = if classification.is_healthy() { "ok" } else { "degraded" };
                HealthProbeResult {
                    agent_name: spec.name.clone(),
                    boot_id: None,
                    timestamp: Utc::now(),
                    round_trip_latency: Duration::from_millis(1),
                    classification,
                    status_token: Some(token.to_string()),
                    raw_payload: Some(serde_json::json!({ "status": token })),
                    detail: None,
                }
            }
            other => HealthProbeResult::unreachable(
                &spec.name,
                other,
                Duration::from_millis(1),
                "scripted failure",
            ),
        };
        result.boot_id = boot_id;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    /// Serve one connection, replying with `reply` (or nothing when `None`).
    async fn agent(reply: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), r#"{"action":"health_check"}"#);
            match reply {
                Some(reply) => {
                    write.write_all(reply.as_bytes()).await.unwrap();
                    write.write_all(b"\n").await.unwrap();
                }
                None => tokio::time::sleep(Duration::from_secs(60)).await,
            }
        });
        addr
    }

    #[rstest]
    #[case("ok", ProbeClassification::Healthy)]
    #[case("OK", ProbeClassification::Healthy)]
    #[case("healthy", ProbeClassification::Healthy)]
    #[case("HEALTHY", ProbeClassification::Healthy)]
    #[case("Healthy", ProbeClassification::Healthy)]
    #[case("received", ProbeClassification::Unhealthy)]
    #[case("degraded", ProbeClassification::Unhealthy)]
    #[case("", ProbeClassification::Unhealthy)]
    fn test_token_classification(#[case] token: &str, #[case] expected: ProbeClassification) {
        let client = HealthCheckClient::default();
        let response = HealthResponse {
            status: token.to_string(),
            raw_payload: serde_json::Map::new(),
        };
        assert_eq!(client.classify(&response), expected);
    }

    #[test]
    fn test_custom_tokens() {
        let tokens = HealthyTokens::from_csv("ready, SERVING");
        assert!(tokens.is_healthy("serving"));
        assert!(!tokens.is_healthy("ok"));
    }

    #[tokio::test]
    async fn test_healthy_agent() {
        let addr = agent(Some(r#"{"status":"HEALTHY","ready":true,"uptime":4.5}"#)).await;
        let result = HealthCheckClient::default().probe_addr("asr", &addr).await;

        assert_eq!(result.classification, ProbeClassification::Healthy);
        assert_eq!(result.status_token.as_deref(), Some("HEALTHY"));
        let payload = result.raw_payload.unwrap();
        assert_eq!(payload["ready"], true);
        assert_eq!(payload["uptime"], 4.5);
    }

    #[tokio::test]
    async fn test_unhealthy_agent() {
        let addr = agent(Some(r#"{"status":"received"}"#)).await;
        let result = HealthCheckClient::default().probe_addr("asr", &addr).await;
        assert_eq!(result.classification, ProbeClassification::Unhealthy);
        assert!(!result.classification.is_unreachable());
    }

    #[tokio::test]
    async fn test_malformed_reply_is_transport_failure() {
        let addr = agent(Some("not json")).await;
        let result = HealthCheckClient::default().probe_addr("asr", &addr).await;
        assert_eq!(result.classification, ProbeClassification::TransportFailure);
        assert!(result.detail.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_silent_agent_times_out_with_capped_latency() {
        let addr = agent(None).await;
        let timeout = Duration::from_millis(100);
        let client = HealthCheckClient::new(timeout, HealthyTokens::default());

        let result = client.probe_addr("asr", &addr).await;
        assert_eq!(result.classification, ProbeClassification::Timeout);
        assert_eq!(result.round_trip_latency, timeout);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = HealthCheckClient::default().probe_addr("asr", &addr).await;
        assert_eq!(result.classification, ProbeClassification::TransportFailure);
        assert!(result.round_trip_latency < DEFAULT_PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_scripted_probe_queue_then_fallback() {
        let probe = ScriptedProbe::new();
        let spec = AgentSpec::new("asr", "localhost", 9000, 9001);
        probe.push("asr", [ProbeClassification::Timeout]);
        probe.set_fallback("asr", ProbeClassification::Unhealthy);

        let boot = BootId::new();
        let first = probe.probe(&spec, Some(boot)).await;
        assert_eq!(first.classification, ProbeClassification::Timeout);
        assert_eq!(first.boot_id, Some(boot));
        assert_eq!(
            probe.probe(&spec, None).await.classification,
            ProbeClassification::Unhealthy
        );
        assert_eq!(probe.calls("asr"), 2);
    }
}
