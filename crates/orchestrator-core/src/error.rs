//! The orchestration-wide error taxonomy.
//!
//! Every component speaks in terms of `ErrorKind`, not raw transport errors.
//! Retryability and HTTP-origin classification live here so the Coordinator,
//! Fallback Manager and agent client agree on a single vocabulary.

use crate::identifiers::AgentId;
use thiserror::Error;

/// The ten-member kind taxonomy a `StepResult::Error` or `OrchestrationError`
/// carries. Kinds are not Rust type names; they are a closed classification
/// used for retry/strategy decisions and for the caller-facing error line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    Auth,
    CapabilityNotFound,
    Timeout,
    RateLimit,
    Transient,
    Unreachable,
    CircuitOpen,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the Coordinator/Fallback Manager may retry or substitute an
    /// alternative agent for an error of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::Transient | Self::Unreachable
        )
    }

    /// Whether strategies 3-4 (cache, degraded response) still apply. Only
    /// `InvalidInput` always surfaces per the propagation policy.
    pub fn allows_soft_fallback(self) -> bool {
        !matches!(self, Self::InvalidInput)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Auth => "AUTH",
            Self::CapabilityNotFound => "CAPABILITY_NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Transient => "TRANSIENT",
            Self::Unreachable => "UNREACHABLE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Classify an HTTP status code per the agent-facing contract.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidInput,
            401 | 403 => Self::Auth,
            404 => Self::CapabilityNotFound,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimit,
            500..=599 => Self::Transient,
            _ => Self::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single error type threaded through the orchestration core.
#[derive(Debug, Error)]
#[error("{kind} on agent {agent_id:?}: {message}")]
pub struct OrchestrationError {
    pub kind: ErrorKind,
    pub message: String,
    pub agent_id: Option<AgentId>,
}

impl OrchestrationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            agent_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn capability_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapabilityNotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, err.to_string())
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert_eq!(ErrorKind::from_http_status(404), ErrorKind::CapabilityNotFound);
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_http_status(500), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::Auth);
    }

    #[test]
    fn retryability_follows_the_classification_table() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Unreachable.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::CapabilityNotFound.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
    }

    #[test]
    fn invalid_input_never_allows_soft_fallback() {
        assert!(!ErrorKind::InvalidInput.allows_soft_fallback());
        assert!(ErrorKind::Transient.allows_soft_fallback());
    }

    #[test]
    fn display_uses_kind_constant() {
        let err = OrchestrationError::timeout("probe exceeded deadline")
            .with_agent(AgentId::parse("weather-1").unwrap());
        assert!(err.to_string().contains("TIMEOUT"));
        assert!(err.to_string().contains("weather-1"));
    }
}
