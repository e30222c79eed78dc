//! Structured logging and metrics for the passage-planning orchestration core.

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "tracing")]
pub mod logging;

#[cfg(feature = "metrics")]
pub use metrics::{MetricsError, OrchestrationMetrics};

#[cfg(feature = "tracing")]
pub use logging::init_tracing;
