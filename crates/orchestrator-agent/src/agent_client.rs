//! The narrow agent-facing contract: `GET /health`, `GET /capabilities`,
//! `POST /tools/<op>`, over the same base URL for every agent.

use crate::types::{AgentDescriptor, Capability};
use async_trait::async_trait;
use orchestrator_core::{AgentId, ErrorKind, OrchestrationError, OrchestrationResult};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct HealthPayload {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitiesPayload {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

impl CapabilitiesPayload {
    pub fn into_descriptor(self, agent_id: AgentId, base_endpoint: String) -> AgentDescriptor {
        let capabilities = self
            .tools
            .into_iter()
            .map(|t| Capability {
                operation: t.name,
                input_schema_ref: t.input_schema.map(|_| "inline".to_string()),
                output_schema_ref: None,
            })
            .collect();
        AgentDescriptor {
            health_endpoint: format!("{base_endpoint}/health"),
            agent_id,
            display_name: self.name,
            version: self.version,
            base_endpoint,
            capabilities,
        }
    }
}

/// An agent value behind a single narrow interface. The Registry stores
/// these and selects them by capability set; no inheritance is required.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn health(&self, base_endpoint: &str) -> OrchestrationResult<HealthPayload>;

    async fn capabilities(&self, base_endpoint: &str) -> OrchestrationResult<CapabilitiesPayload>;

    async fn execute(
        &self,
        base_endpoint: &str,
        operation: &str,
        input: serde_json::Value,
        deadline: Duration,
    ) -> OrchestrationResult<serde_json::Value>;
}

/// Default implementation speaking real HTTP via `reqwest`.
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn map_transport_error(err: reqwest::Error) -> OrchestrationError {
        if err.is_timeout() {
            OrchestrationError::new(ErrorKind::Timeout, err.to_string())
        } else if err.is_connect() {
            OrchestrationError::new(ErrorKind::Unreachable, err.to_string())
        } else {
            OrchestrationError::new(ErrorKind::Transient, err.to_string())
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn health(&self, base_endpoint: &str) -> OrchestrationResult<HealthPayload> {
        let resp = self
            .client
            .get(format!("{base_endpoint}/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !resp.status().is_success() {
            let kind = ErrorKind::from_http_status(resp.status().as_u16());
            return Err(OrchestrationError::new(kind, "health probe returned non-success status"));
        }

        resp.json::<HealthPayload>()
            .await
            .map_err(|e| OrchestrationError::new(ErrorKind::Internal, e.to_string()))
    }

    async fn capabilities(&self, base_endpoint: &str) -> OrchestrationResult<CapabilitiesPayload> {
        let resp = self
            .client
            .get(format!("{base_endpoint}/capabilities"))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !resp.status().is_success() {
            let kind = ErrorKind::from_http_status(resp.status().as_u16());
            return Err(OrchestrationError::new(kind, "capabilities probe returned non-success status"));
        }

        resp.json::<CapabilitiesPayload>()
            .await
            .map_err(|e| OrchestrationError::new(ErrorKind::Internal, e.to_string()))
    }

    async fn execute(
        &self,
        base_endpoint: &str,
        operation: &str,
        input: serde_json::Value,
        deadline: Duration,
    ) -> OrchestrationResult<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{base_endpoint}/tools/{operation}"))
            .json(&input)
            .timeout(deadline)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let kind = ErrorKind::from_http_status(status);
            return Err(OrchestrationError::new(kind, format!("agent returned HTTP {status}")));
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| OrchestrationError::new(ErrorKind::Internal, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn health_maps_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new();
        let payload = client.health(&server.uri()).await.unwrap();
        assert_eq!(payload.status, "healthy");
    }

    #[tokio::test]
    async fn execute_maps_429_to_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/get_marine_forecast"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new();
        let err = client
            .execute(&server.uri(), "get_marine_forecast", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn execute_maps_404_to_capability_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/unknown_op"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpAgentClient::new();
        let err = client
            .execute(&server.uri(), "unknown_op", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityNotFound);
        assert!(!err.is_retryable());
    }
}
