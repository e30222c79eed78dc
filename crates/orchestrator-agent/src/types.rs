//! Core data model: descriptors, runtime state, plans, steps, results.

use chrono::{DateTime, Utc};
use orchestrator_core::{AgentId, OrchestrationError, PlanId, RequestId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A named unit of work an agent offers, with schema references kept opaque
/// (the core never validates agent-side schemas, only routes by name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub operation: String,
    pub input_schema_ref: Option<String>,
    pub output_schema_ref: Option<String>,
}

impl Capability {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            input_schema_ref: None,
            output_schema_ref: None,
        }
    }
}

/// Identity of an agent. Immutable between discovery updates; replaced
/// atomically (not mutated in place) when declared capabilities change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub display_name: String,
    pub version: String,
    pub base_endpoint: String,
    pub capabilities: Vec<Capability>,
    pub health_endpoint: String,
}

impl AgentDescriptor {
    pub fn supports(&self, operation: &str) -> bool {
        self.capabilities.iter().any(|c| c.operation == operation)
    }
}

/// Status of an agent as tracked by the Health Monitor and the Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Degraded,
    Error,
    Unknown,
}

impl AgentStatus {
    /// Whether the Registry's selector may return an agent in this status.
    pub fn is_selectable(self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

/// Rolling metrics kept alongside an `AgentDescriptor`, mutated only by the
/// Health Monitor and the Coordinator after each call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub request_count: u64,
    pub failure_count: u64,
    /// Exponential moving average latency, alpha = 0.25.
    pub avg_latency_ms: f64,
    /// Success rate over a rolling 20-request window.
    pub success_rate: f64,
    window: Vec<bool>,
}

const SUCCESS_RATE_WINDOW: usize = 20;
const LATENCY_EMA_ALPHA: f64 = 0.25;

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            request_count: 0,
            failure_count: 0,
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            window: Vec::new(),
        }
    }
}

impl AgentMetrics {
    pub fn record(&mut self, latency: Duration, ok: bool) {
        self.request_count += 1;
        if !ok {
            self.failure_count += 1;
        }

        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.request_count == 1 {
            latency_ms
        } else {
            LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms
        };

        self.window.push(ok);
        if self.window.len() > SUCCESS_RATE_WINDOW {
            self.window.remove(0);
        }
        let successes = self.window.iter().filter(|&&ok| ok).count();
        self.success_rate = successes as f64 / self.window.len() as f64;
    }
}

/// Per-agent-id state, mutated only by the Health Monitor and Coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntimeState {
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metrics: AgentMetrics,
    pub last_error: Option<String>,
    pub consecutive_health_failures: u32,
}

impl Default for AgentRuntimeState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Unknown,
            last_heartbeat: None,
            metrics: AgentMetrics::default(),
            last_error: None,
            consecutive_health_failures: 0,
        }
    }
}

/// A user's passage-planning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageRequest {
    pub request_id: RequestId,
    pub departure: GeoPoint,
    pub destination: GeoPoint,
    pub waypoints: Vec<GeoPoint>,
    pub vessel: VesselProfile,
    pub preferences: PassagePreferences,
    pub departure_time: DateTime<Utc>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselProfile {
    pub kind: String,
    pub cruise_speed_kn: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PassagePreferences {
    pub max_wind_kn: Option<f64>,
    pub max_wave_ft: Option<f64>,
    pub avoid_night: bool,
    pub avoid_areas: Vec<String>,
}

/// A closed enumeration of capability classes the Router and Aggregator can
/// handle exhaustively. The wire contract still carries operation names as
/// strings (see `Capability`); this enum is the internal vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    Ports,
    Route,
    Weather,
    Wind,
    Tides,
    Safety,
    /// Anything not in the closed set routes through with no aggregation.
    Opaque,
}

impl CapabilityClass {
    pub fn operation_name(self) -> &'static str {
        match self {
            Self::Ports => "get_port_info",
            Self::Route => "calculate_route",
            Self::Weather => "get_marine_forecast",
            Self::Wind => "analyze_wind",
            Self::Tides => "get_tide_predictions",
            Self::Safety => "check_safety",
            Self::Opaque => "",
        }
    }

    /// Per-capability-class cache TTL in seconds, per the Fallback Manager's
    /// cache policy.
    pub fn cache_ttl(self) -> Duration {
        let secs = match self {
            Self::Weather => 300,
            Self::Wind => 1800,
            Self::Tides => 86_400,
            Self::Ports => 86_400,
            Self::Route => 1800,
            Self::Safety | Self::Opaque => 600,
        };
        Duration::from_secs(secs)
    }

    /// Per-call timeout class (10-20s).
    pub fn step_timeout(self) -> Duration {
        let secs = match self {
            Self::Route => 20,
            Self::Weather | Self::Wind => 15,
            Self::Tides | Self::Ports | Self::Safety => 10,
            Self::Opaque => 10,
        };
        Duration::from_secs(secs)
    }
}

/// An input template: static values plus references to other steps' outputs,
/// resolved by the Coordinator when a step becomes ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InputTemplate {
    pub static_values: serde_json::Map<String, serde_json::Value>,
    /// Maps a field name to `(dependency step id, JSON pointer into its output)`.
    pub references: Vec<(String, StepId, String)>,
}

/// How a step selects its target agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentSelector {
    Fixed(AgentId),
    AnyCapable,
}

/// A node in the Execution Plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub capability: CapabilityClass,
    pub operation: String,
    pub selector: AgentSelector,
    pub fallback_agent: Option<AgentId>,
    pub depends_on: Vec<StepId>,
    pub input: InputTemplate,
    pub timeout: Duration,
    pub retry_budget: u32,
    /// A fan-out placeholder is expanded into sibling sub-steps lazily once
    /// its single dependency (the route step) resolves.
    pub fan_out_of: Option<StepId>,
    /// Set on a step generated by fan-out expansion; `None` on a template or
    /// an ordinary step.
    pub waypoint_index: Option<usize>,
}

/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: PlanId,
    pub request_id: RequestId,
    pub user_id: Option<String>,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub deadline: Duration,
    /// Declared mapping from semantic slot to the step id that fills it, so
    /// the Aggregator never infers slots from step names.
    pub slot_map: HashMap<String, StepId>,
}

impl ExecutionPlan {
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// DAG soundness: acyclic and every dependency id exists in the plan.
    pub fn is_acyclic(&self) -> bool {
        let mut visiting = std::collections::HashSet::new();
        let mut visited = std::collections::HashSet::new();

        fn visit(
            plan: &ExecutionPlan,
            id: &StepId,
            visiting: &mut std::collections::HashSet<StepId>,
            visited: &mut std::collections::HashSet<StepId>,
        ) -> bool {
            if visited.contains(id) {
                return true;
            }
            if visiting.contains(id) {
                return false;
            }
            let Some(step) = plan.step(id) else {
                return false;
            };
            visiting.insert(id.clone());
            for dep in &step.depends_on {
                if !visit(plan, dep, visiting, visited) {
                    return false;
                }
            }
            visiting.remove(id);
            visited.insert(id.clone());
            true
        }

        self.steps
            .iter()
            .all(|s| visit(self, &s.id, &mut visiting, &mut visited))
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepResult {
    Ok {
        payload: serde_json::Value,
        latency: Duration,
        source_agent_id: AgentId,
        fallback: bool,
        strategy: Option<String>,
        degraded: bool,
    },
    Error {
        kind: orchestrator_core::ErrorKind,
        message: String,
        retryable: bool,
        source_agent_id: Option<AgentId>,
    },
    Skipped {
        reason: String,
    },
}

impl StepResult {
    pub fn from_error(err: &OrchestrationError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.message.clone(),
            retryable: err.is_retryable(),
            source_agent_id: err.agent_id.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        true // every variant of StepResult represents a terminal outcome
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Live per-execution scratchpad.
#[derive(Debug)]
pub struct WorkflowContext {
    pub plan_id: PlanId,
    pub start_time: std::time::Instant,
    pub results: HashMap<StepId, StepResult>,
    pub cancelled: bool,
}

impl WorkflowContext {
    pub fn new(plan_id: PlanId) -> Self {
        Self {
            plan_id,
            start_time: std::time::Instant::now(),
            results: HashMap::new(),
            cancelled: false,
        }
    }
}

/// The final product handed back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedPlan {
    pub plan_id: PlanId,
    pub request: PassageRequest,
    pub route: Option<serde_json::Value>,
    pub weather: Vec<serde_json::Value>,
    pub tides: Option<serde_json::Value>,
    pub wind: Option<serde_json::Value>,
    pub safety: Option<serde_json::Value>,
    pub ports: Option<serde_json::Value>,
    pub total_distance_nm: Option<f64>,
    pub estimated_duration_hours: Option<f64>,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Keyed cache entry, process-scoped, outlives any single plan.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub stored_at: std::time::Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            id: orchestrator_core::StepId::new_unchecked(id),
            capability: CapabilityClass::Opaque,
            operation: "noop".to_string(),
            selector: AgentSelector::AnyCapable,
            fallback_agent: None,
            depends_on: deps
                .iter()
                .map(|d| orchestrator_core::StepId::new_unchecked(*d))
                .collect(),
            input: InputTemplate::default(),
            timeout: Duration::from_secs(10),
            retry_budget: 2,
            fan_out_of: None,
            waypoint_index: None,
        }
    }

    fn plan(steps: Vec<Step>) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: orchestrator_core::PlanId::generate(),
            request_id: orchestrator_core::RequestId::generate(),
            user_id: None,
            steps,
            created_at: Utc::now(),
            deadline: Duration::from_secs(60),
            slot_map: HashMap::new(),
        }
    }

    #[test]
    fn acyclic_plan_passes() {
        let p = plan(vec![step("ports", &[]), step("route", &["ports"])]);
        assert!(p.is_acyclic());
    }

    #[test]
    fn cyclic_plan_fails() {
        let p = plan(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(!p.is_acyclic());
    }

    #[test]
    fn dangling_dependency_fails() {
        let p = plan(vec![step("route", &["missing"])]);
        assert!(!p.is_acyclic());
    }

    #[test]
    fn metrics_ema_and_window() {
        let mut m = AgentMetrics::default();
        m.record(Duration::from_millis(100), true);
        m.record(Duration::from_millis(200), true);
        assert!(m.avg_latency_ms > 100.0 && m.avg_latency_ms < 200.0);
        assert_eq!(m.success_rate, 1.0);
        m.record(Duration::from_millis(100), false);
        assert!(m.success_rate < 1.0);
    }

    #[test]
    fn cache_entry_freshness() {
        let fresh = CacheEntry {
            payload: serde_json::json!({}),
            stored_at: std::time::Instant::now(),
            ttl: Duration::from_secs(300),
        };
        assert!(fresh.is_fresh());
    }
}
