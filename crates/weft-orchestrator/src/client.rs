use crate::registry::AgentRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use weft_core::{WeftError, WeftResult};

/// Path appended to an agent endpoint for work execution.
pub const EXECUTE_PATH: &str = "/orchestration/execute";
/// Path appended to an agent endpoint for liveness probes.
pub const HEALTH_PATH: &str = "/health";

/// Body of `POST <endpoint>/orchestration/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub stage_id: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    pub deadline_ms: u64,
}

/// Error object an agent may return instead of an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retryable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<AgentErrorBody>,
}

/// Why a single call to an agent failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchFailure {
    /// Timeout, connection failure, 5xx, or `retryable: true`.
    #[error("retryable failure: {0}")]
    Retryable(String),
    /// `retryable: false` or a 4xx without a retry signal.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl DispatchFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchFailure::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            DispatchFailure::Retryable(m) | DispatchFailure::Permanent(m) => m,
        }
    }
}

/// Response of `GET <endpoint>/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

fn describe(err: &AgentErrorBody) -> String {
    match &err.code {
        Some(code) => format!("{code}: {}", err.message),
        None => err.message.clone(),
    }
}

/// Classify an agent's HTTP response into an output or a [`DispatchFailure`].
///
/// An explicit `retryable` flag in the body always wins. Without one, 2xx
/// errors and 4xx statuses are permanent, except 408/425/429 which are
/// retryable like every other status.
pub fn classify_response(status: u16, body: &str) -> Result<serde_json::Value, DispatchFailure> {
    let parsed: Option<ExecuteResponse> = serde_json::from_str(body).ok();

    if (200..300).contains(&status) {
        let Some(resp) = parsed else {
            return Err(DispatchFailure::Retryable(format!(
                "malformed response body from agent (HTTP {status})"
            )));
        };
        if let Some(err) = resp.error {
            return if err.retryable == Some(true) {
                Err(DispatchFailure::Retryable(describe(&err)))
            } else {
                Err(DispatchFailure::Permanent(describe(&err)))
            };
        }
        return Ok(resp.output.unwrap_or(serde_json::Value::Null));
    }

    let detail = parsed
        .as_ref()
        .and_then(|r| r.error.as_ref())
        .map(describe)
        .unwrap_or_else(|| format!("HTTP {status}"));
    let explicit = parsed.and_then(|r| r.error).and_then(|e| e.retryable);

    match explicit {
        Some(true) => Err(DispatchFailure::Retryable(detail)),
        Some(false) => Err(DispatchFailure::Permanent(detail)),
        None if (400..500).contains(&status) && !matches!(status, 408 | 425 | 429) => {
            Err(DispatchFailure::Permanent(format!("HTTP {status}: {detail}")))
        }
        None => Err(DispatchFailure::Retryable(format!("HTTP {status}: {detail}"))),
    }
}

/// Network seam between the dispatcher and remote agents.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Execute one unit of work on an agent within `timeout`.
    async fn execute(
        &self,
        agent: &AgentRecord,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchFailure>;

    /// Probe the agent's health endpoint.
    async fn health(&self, agent: &AgentRecord, timeout: Duration) -> WeftResult<HealthReport>;
}

/// [`AgentTransport`] over HTTP/JSON with `reqwest`.
#[derive(Clone, Default)]
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(agent: &AgentRecord, path: &str) -> String {
        format!("{}{}", agent.endpoint.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn execute(
        &self,
        agent: &AgentRecord,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchFailure> {
        let url = Self::url(agent, EXECUTE_PATH);
        let mut builder = self.client.post(&url).timeout(timeout).json(request);
        if let Some(token) = &agent.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchFailure::Retryable(format!(
                    "timeout after {}ms calling {url}",
                    timeout.as_millis()
                ))
            } else {
                DispatchFailure::Retryable(format!("request to {url} failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchFailure::Retryable(format!("failed to read response: {e}")))?;
        debug!(agent_id = %agent.id, status, "Agent responded");
        classify_response(status, &body)
    }

    async fn health(&self, agent: &AgentRecord, timeout: Duration) -> WeftResult<HealthReport> {
        let url = Self::url(agent, HEALTH_PATH);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| WeftError::Http(format!("health probe to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(WeftError::Http(format!(
                "health probe to {url} returned {}",
                response.status()
            )));
        }
        response
            .json::<HealthReport>()
            .await
            .map_err(|e| WeftError::Http(format!("invalid health response from {url}: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_output() {
        let out = classify_response(200, r#"{"output":{"summary":"ok"}}"#).unwrap();
        assert_eq!(out, json!({"summary": "ok"}));
    }

    #[test]
    fn test_success_without_output_is_null() {
        assert_eq!(classify_response(204, "{}").unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_2xx_error_flag() {
        let retry = classify_response(
            200,
            r#"{"error":{"code":"busy","message":"try later","retryable":true}}"#,
        )
        .unwrap_err();
        assert_eq!(retry, DispatchFailure::Retryable("busy: try later".into()));

        let perm = classify_response(
            200,
            r#"{"error":{"code":"bad_input","message":"no code","retryable":false}}"#,
        )
        .unwrap_err();
        assert!(!perm.is_retryable());

        let silent = classify_response(200, r#"{"error":{"message":"nope"}}"#).unwrap_err();
        assert!(!silent.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_response(500, "").unwrap_err().is_retryable());
        assert!(classify_response(503, "oops").unwrap_err().is_retryable());
        assert!(classify_response(429, "").unwrap_err().is_retryable());
        assert!(classify_response(408, "").unwrap_err().is_retryable());
        assert!(!classify_response(400, "").unwrap_err().is_retryable());
        assert!(!classify_response(422, "{}").unwrap_err().is_retryable());
    }

    #[test]
    fn test_explicit_flag_overrides_status() {
        let err = classify_response(
            400,
            r#"{"error":{"message":"rate window","retryable":true}}"#,
        )
        .unwrap_err();
        assert!(err.is_retryable());

        let err = classify_response(
            503,
            r#"{"error":{"message":"model removed","retryable":false}}"#,
        )
        .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message().contains("model removed"));
    }

    #[test]
    fn test_malformed_2xx_is_retryable() {
        assert!(classify_response(200, "<html>").unwrap_err().is_retryable());
    }

    #[test]
    fn test_execute_request_wire_shape() {
        let req = ExecuteRequest {
            stage_id: "research".into(),
            input: json!({"code": "x"}),
            context: json!({"run_id": "r"}),
            deadline_ms: 5000,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["stage_id"], "research");
        assert_eq!(v["deadline_ms"], 5000);
    }

    #[test]
    fn test_health_report() {
        let report: HealthReport =
            serde_json::from_str(r#"{"status":"healthy","timestamp":"2026-01-01T00:00:00Z"}"#)
                .unwrap();
        assert!(report.is_healthy());
    }
}
