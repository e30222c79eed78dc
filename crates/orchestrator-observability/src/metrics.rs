//! Prometheus metrics for the orchestration core.
//!
//! Labels stay per-agent/per-operation (bounded by the registry size);
//! per-request labels are never used, to keep cardinality bounded.

use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, register_counter_vec,
    register_gauge, register_histogram_vec,
};
use thiserror::Error;

/// Latency buckets in seconds, tuned for agent calls (tens of ms to tens of
/// seconds) rather than in-process operations.
pub const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Counters and histograms for the seven orchestration components.
#[derive(Debug)]
pub struct OrchestrationMetrics {
    pub steps_total: CounterVec,              // labels: agent_id, operation, outcome
    pub step_duration_seconds: HistogramVec,   // labels: agent_id, operation
    pub breaker_transitions_total: CounterVec, // labels: agent_id, operation, to_state
    pub cache_hits_total: CounterVec,          // labels: operation
    pub cache_misses_total: CounterVec,        // labels: operation
    pub plans_in_flight: Gauge,
    pub plan_duration_seconds: HistogramVec, // labels: outcome
    pub strategy_used_total: CounterVec,     // labels: strategy
}

impl OrchestrationMetrics {
    pub fn new(registry: &Registry, namespace: &str) -> Result<Self, MetricsError> {
        let steps_total = register_counter_vec!(
            Opts::new(format!("{namespace}_steps_total"), "Step outcomes by agent, operation and outcome"),
            &["agent_id", "operation", "outcome"]
        )?;
        registry.register(Box::new(steps_total.clone()))?;

        let step_duration_seconds = register_histogram_vec!(
            HistogramOpts::new(
                format!("{namespace}_step_duration_seconds"),
                "Step call latency by agent and operation"
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["agent_id", "operation"]
        )?;
        registry.register(Box::new(step_duration_seconds.clone()))?;

        let breaker_transitions_total = register_counter_vec!(
            Opts::new(
                format!("{namespace}_breaker_transitions_total"),
                "Circuit breaker state transitions"
            ),
            &["agent_id", "operation", "to_state"]
        )?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;

        let cache_hits_total = register_counter_vec!(
            Opts::new(format!("{namespace}_cache_hits_total"), "Fallback cache hits by operation"),
            &["operation"]
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = register_counter_vec!(
            Opts::new(format!("{namespace}_cache_misses_total"), "Fallback cache misses by operation"),
            &["operation"]
        )?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let plans_in_flight = register_gauge!(Opts::new(
            format!("{namespace}_plans_in_flight"),
            "Execution plans currently running"
        ))?;
        registry.register(Box::new(plans_in_flight.clone()))?;

        let plan_duration_seconds = register_histogram_vec!(
            HistogramOpts::new(
                format!("{namespace}_plan_duration_seconds"),
                "Plan end-to-end latency by outcome"
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["outcome"]
        )?;
        registry.register(Box::new(plan_duration_seconds.clone()))?;

        let strategy_used_total = register_counter_vec!(
            Opts::new(
                format!("{namespace}_strategy_used_total"),
                "Fallback strategy that resolved a step"
            ),
            &["strategy"]
        )?;
        registry.register(Box::new(strategy_used_total.clone()))?;

        Ok(Self {
            steps_total,
            step_duration_seconds,
            breaker_transitions_total,
            cache_hits_total,
            cache_misses_total,
            plans_in_flight,
            plan_duration_seconds,
            strategy_used_total,
        })
    }

    pub fn record_step(&self, agent_id: &str, operation: &str, outcome: &str, duration: std::time::Duration) {
        self.steps_total.with_label_values(&[agent_id, operation, outcome]).inc();
        self.step_duration_seconds.with_label_values(&[agent_id, operation]).observe(duration.as_secs_f64());
    }

    pub fn record_breaker_transition(&self, agent_id: &str, operation: &str, to_state: &str) {
        self.breaker_transitions_total.with_label_values(&[agent_id, operation, to_state]).inc();
    }

    pub fn record_cache_hit(&self, operation: &str) {
        self.cache_hits_total.with_label_values(&[operation]).inc();
    }

    pub fn record_cache_miss(&self, operation: &str) {
        self.cache_misses_total.with_label_values(&[operation]).inc();
    }

    pub fn record_strategy(&self, strategy: &str) {
        self.strategy_used_total.with_label_values(&[strategy]).inc();
    }

    pub fn record_plan_started(&self) {
        self.plans_in_flight.inc();
    }

    pub fn record_plan_finished(&self, outcome: &str, duration: std::time::Duration) {
        self.plans_in_flight.dec();
        self.plan_duration_seconds.with_label_values(&[outcome]).observe(duration.as_secs_f64());
    }
}
