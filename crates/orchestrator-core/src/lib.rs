//! Shared identifiers and error taxonomy for the passage-planning
//! orchestration core.
//!
//! This crate has no async runtime dependency and no knowledge of agents,
//! plans, or HTTP; it exists so that `orchestrator-agent` and
//! `orchestrator-observability` agree on the same vocabulary of ids and
//! error kinds without depending on each other.

pub mod error;
pub mod identifiers;

pub use error::{ErrorKind, OrchestrationError, OrchestrationResult};
pub use identifiers::{AgentId, IdValidationError, PlanId, RequestId, StepId};
