//! Fallback Manager: the single chokepoint through which the Coordinator
//! talks to agents. Owns per-(agent, operation) circuit breakers, the
//! response cache, and the ordered strategy list.

use crate::agent_client::AgentClient;
use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::cache::{CacheConfig, CacheKey, ResponseCache};
use crate::registry::AgentRegistry;
use crate::types::StepResult;
use orchestrator_core::{AgentId, ErrorKind, OrchestrationError};
use orchestrator_observability::OrchestrationMetrics;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use crate::cache::CacheConfig as FallbackCacheConfig;

type BreakerKey = (AgentId, String);

pub struct FallbackManager {
    breakers: RwLock<HashMap<BreakerKey, Arc<CircuitBreaker>>>,
    /// Agents forced open by the Health Monitor, keyed by agent id, valued
    /// by the instant the force expires. Consulted ahead of any
    /// per-operation breaker so an operation never dispatched before still
    /// starts rejected, rather than defaulting closed on first lookup.
    forced_open: RwLock<HashMap<AgentId, Instant>>,
    breaker_config: BreakerConfig,
    cache: ResponseCache,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

/// Outcome of a single fallback-managed call, carrying the strategy that
/// ultimately resolved it so the Aggregator can label the output.
pub struct Outcome {
    pub result: StepResult,
    pub strategy: Option<&'static str>,
}

impl FallbackManager {
    pub fn new(breaker_config: BreakerConfig, cache_config: CacheConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            forced_open: RwLock::new(HashMap::new()),
            breaker_config,
            cache: ResponseCache::new(cache_config),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn breaker_for(&self, agent_id: &AgentId, operation: &str) -> Arc<CircuitBreaker> {
        let key = (agent_id.clone(), operation.to_string());
        if let Some(b) = self.breakers.read().unwrap().get(&key) {
            return Arc::clone(b);
        }
        let mut breakers = self.breakers.write().unwrap();
        Arc::clone(
            breakers
                .entry(key)
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone()))),
        )
    }

    fn forced_open_until(&self, agent_id: &AgentId) -> Option<Instant> {
        self.forced_open.read().unwrap().get(agent_id).copied()
    }

    pub fn is_call_allowed(&self, agent_id: &AgentId, operation: &str) -> bool {
        if let Some(until) = self.forced_open_until(agent_id) {
            if Instant::now() < until {
                return false;
            }
            self.forced_open.write().unwrap().remove(agent_id);
        }
        self.breaker_for(agent_id, operation).is_allowed()
    }

    pub fn breaker_state(&self, agent_id: &AgentId, operation: &str) -> BreakerState {
        if let Some(until) = self.forced_open_until(agent_id) {
            if Instant::now() < until {
                return BreakerState::Open;
            }
        }
        self.breaker_for(agent_id, operation).state()
    }

    /// Called by the Health Monitor on a successful probe: credits every
    /// breaker owned by this agent with a success and lifts any standing
    /// force-open from a prior run of consecutive probe failures.
    pub fn credit_health_success(&self, agent_id: &AgentId) {
        self.forced_open.write().unwrap().remove(agent_id);
        let breakers = self.breakers.read().unwrap();
        for ((id, _), breaker) in breakers.iter() {
            if id == agent_id {
                breaker.record_success();
            }
        }
    }

    /// Called by the Health Monitor after three consecutive probe failures:
    /// forces every breaker owned by this agent open, including operations
    /// never yet dispatched to (which would otherwise have no breaker in
    /// the map and default closed).
    pub fn force_open_all_operations(&self, agent_id: &AgentId) {
        self.forced_open
            .write()
            .unwrap()
            .insert(agent_id.clone(), Instant::now() + self.breaker_config.reset_timeout);

        let breakers = self.breakers.read().unwrap();
        for ((id, _), breaker) in breakers.iter() {
            if id == agent_id {
                breaker.force_open();
            }
        }
    }

    fn note_breaker_transition(&self, agent_id: &AgentId, operation: &str, before: BreakerState, after: BreakerState) {
        if before == after {
            return;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(agent_id.as_str(), operation, &after.to_string());
        }
    }

    /// Dispatch a call with the full strategy chain. `candidates` is the
    /// ordered agent preference list (primary first, alternatives after),
    /// already filtered to agents declaring `operation`.
    pub async fn dispatch<C: AgentClient>(
        &self,
        candidates: &[AgentId],
        operation: &str,
        capability_key: &str,
        input: serde_json::Value,
        deadline: Duration,
        cache_ttl: Duration,
        registry: &AgentRegistry,
        client: &C,
    ) -> Outcome {
        let mut last_error: Option<OrchestrationError> = None;

        for (idx, agent_id) in candidates.iter().enumerate() {
            let Some(descriptor) = registry.lookup(agent_id) else {
                continue;
            };

            if !self.is_call_allowed(agent_id, operation) {
                debug!(agent = %agent_id, operation, "breaker open, skipping candidate");
                last_error = Some(
                    OrchestrationError::circuit_open(format!("breaker open for {agent_id}/{operation}"))
                        .with_agent(agent_id.clone()),
                );
                continue;
            }
            let breaker = self.breaker_for(agent_id, operation);
            let state_before = breaker.state();

            let started = Instant::now();
            match client.execute(&descriptor.base_endpoint, operation, input.clone(), deadline).await {
                Ok(payload) => {
                    let latency = started.elapsed();
                    breaker.record_success();
                    self.note_breaker_transition(agent_id, operation, state_before, breaker.state());
                    registry.record_outcome(agent_id, latency, true, None);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_step(agent_id.as_str(), operation, "ok", latency);
                    }
                    let key = CacheKey::new(capability_key, operation, &input);
                    self.cache.put(key, payload.clone(), cache_ttl);
                    if idx > 0 {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_strategy("alternative_agent");
                        }
                    }
                    return Outcome {
                        result: StepResult::Ok {
                            payload,
                            latency,
                            source_agent_id: agent_id.clone(),
                            fallback: idx > 0,
                            strategy: if idx > 0 { Some("alternative_agent".to_string()) } else { None },
                            degraded: false,
                        },
                        strategy: if idx > 0 { Some("alternative_agent") } else { None },
                    };
                }
                Err(err) => {
                    let latency = started.elapsed();
                    breaker.record_failure();
                    self.note_breaker_transition(agent_id, operation, state_before, breaker.state());
                    registry.record_outcome(agent_id, latency, false, Some(err.message.clone()));
                    if let Some(metrics) = &self.metrics {
                        metrics.record_step(agent_id.as_str(), operation, "error", latency);
                    }
                    warn!(agent = %agent_id, operation, kind = ?err.kind(), "agent call failed");
                    let retry_alt = err.is_retryable() && err.kind() != ErrorKind::CapabilityNotFound;
                    last_error = Some(err.with_agent(agent_id.clone()));
                    if !retry_alt {
                        break;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| OrchestrationError::internal("no candidate agent available"));

        if err.kind() == ErrorKind::InvalidInput {
            return Outcome { result: StepResult::from_error(&err), strategy: None };
        }

        if err.kind() == ErrorKind::RateLimit {
            debug!(operation, "rate limited, queuing for later");
            if let Some(metrics) = &self.metrics {
                metrics.record_strategy("queue");
            }
            return Outcome {
                result: StepResult::Skipped { reason: "deferred".to_string() },
                strategy: Some("queue"),
            };
        }

        if err.kind().allows_soft_fallback() {
            let key = CacheKey::new(capability_key, operation, &input);
            if let Some(cached) = self.cache.get(&key) {
                debug!(operation, "serving cached response after exhausting candidates");
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_hit(operation);
                    metrics.record_strategy("cache");
                }
                return Outcome {
                    result: StepResult::Ok {
                        payload: cached,
                        latency: Duration::ZERO,
                        source_agent_id: candidates.first().cloned().unwrap_or_else(|| AgentId::new_unchecked("unknown")),
                        fallback: true,
                        strategy: Some("cache".to_string()),
                        degraded: false,
                    },
                    strategy: Some("cache"),
                };
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_miss(operation);
            }

            warn!(operation, "no cached response, returning degraded placeholder");
            if let Some(metrics) = &self.metrics {
                metrics.record_strategy("degraded");
            }
            return Outcome {
                result: StepResult::Ok {
                    payload: degraded_placeholder(operation, &err),
                    latency: Duration::ZERO,
                    source_agent_id: candidates.first().cloned().unwrap_or_else(|| AgentId::new_unchecked("unknown")),
                    fallback: true,
                    strategy: Some("degraded".to_string()),
                    degraded: true,
                },
                strategy: Some("degraded"),
            };
        }

        Outcome { result: StepResult::from_error(&err), strategy: None }
    }
}

fn degraded_placeholder(operation: &str, err: &OrchestrationError) -> serde_json::Value {
    serde_json::json!({
        "degraded": true,
        "operation": operation,
        "message": format!("{operation} temporarily unavailable: {}", err.message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::{CapabilitiesPayload, HealthPayload};
    use crate::types::{AgentDescriptor, Capability};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedClient {
        failures_before_success: AtomicU32,
        kind: ErrorKind,
    }

    #[async_trait]
    impl AgentClient for ScriptedClient {
        async fn health(&self, _base: &str) -> orchestrator_core::OrchestrationResult<HealthPayload> {
            unimplemented!()
        }
        async fn capabilities(&self, _base: &str) -> orchestrator_core::OrchestrationResult<CapabilitiesPayload> {
            unimplemented!()
        }
        async fn execute(
            &self,
            _base: &str,
            _op: &str,
            _input: serde_json::Value,
            _deadline: Duration,
        ) -> orchestrator_core::OrchestrationResult<serde_json::Value> {
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                Err(OrchestrationError::new(self.kind, "scripted failure"))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    fn registry_with(id: &str) -> (Arc<AgentRegistry>, AgentId) {
        let registry = Arc::new(AgentRegistry::new());
        let agent_id = AgentId::parse(id).unwrap();
        registry.register(AgentDescriptor {
            agent_id: agent_id.clone(),
            display_name: id.into(),
            version: "1.0".into(),
            base_endpoint: format!("http://{id}"),
            capabilities: vec![Capability::new("get_marine_forecast")],
            health_endpoint: format!("http://{id}/health"),
        });
        registry.update_status(&agent_id, crate::types::AgentStatus::Active, None);
        (registry, agent_id)
    }

    #[tokio::test]
    async fn successful_call_populates_cache() {
        let (registry, id) = registry_with("weather-1");
        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());
        let client = ScriptedClient { failures_before_success: AtomicU32::new(0), kind: ErrorKind::Transient };

        let outcome = manager
            .dispatch(&[id.clone()], "get_marine_forecast", "weather-1", serde_json::json!({"wp": 1}), Duration::from_secs(5), Duration::from_secs(300), &registry, &client)
            .await;
        assert!(matches!(outcome.result, StepResult::Ok { fallback: false, .. }));

        let key = CacheKey::new("weather-1", "get_marine_forecast", &serde_json::json!({"wp": 1}));
        assert!(manager.cache.get(&key).is_some());
    }

    #[tokio::test]
    async fn five_consecutive_timeouts_open_breaker() {
        let (registry, id) = registry_with("weather-1");
        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());
        let client = ScriptedClient { failures_before_success: AtomicU32::new(99), kind: ErrorKind::Timeout };

        for _ in 0..5 {
            manager
                .dispatch(&[id.clone()], "get_marine_forecast", "weather-1", serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(300), &registry, &client)
                .await;
        }
        assert_eq!(manager.breaker_state(&id, "get_marine_forecast"), BreakerState::Open);

        let outcome = manager
            .dispatch(&[id.clone()], "get_marine_forecast", "weather-1", serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(300), &registry, &client)
            .await;
        match outcome.result {
            StepResult::Error { kind, .. } => assert_eq!(kind, ErrorKind::CircuitOpen),
            _ => panic!("expected circuit open error"),
        }
    }

    #[tokio::test]
    async fn degraded_response_used_when_no_cache_and_not_invalid_input() {
        let (registry, id) = registry_with("weather-1");
        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());
        let client = ScriptedClient { failures_before_success: AtomicU32::new(99), kind: ErrorKind::Transient };

        let outcome = manager
            .dispatch(&[id], "get_marine_forecast", "weather-1", serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(300), &registry, &client)
            .await;
        match outcome.result {
            StepResult::Ok { degraded, .. } => assert!(degraded),
            _ => panic!("expected degraded ok result"),
        }
        assert_eq!(outcome.strategy, Some("degraded"));
    }

    #[tokio::test]
    async fn invalid_input_never_falls_back() {
        let (registry, id) = registry_with("weather-1");
        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());
        let client = ScriptedClient { failures_before_success: AtomicU32::new(99), kind: ErrorKind::InvalidInput };

        let outcome = manager
            .dispatch(&[id], "get_marine_forecast", "weather-1", serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(300), &registry, &client)
            .await;
        match outcome.result {
            StepResult::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidInput),
            _ => panic!("invalid input must surface, never fall back"),
        }
    }

    #[tokio::test]
    async fn rate_limit_queues_instead_of_falling_back() {
        let (registry, id) = registry_with("weather-1");
        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());
        let client = ScriptedClient { failures_before_success: AtomicU32::new(99), kind: ErrorKind::RateLimit };

        let outcome = manager
            .dispatch(&[id], "get_marine_forecast", "weather-1", serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(300), &registry, &client)
            .await;
        assert_eq!(outcome.strategy, Some("queue"));
        match outcome.result {
            StepResult::Skipped { reason } => assert_eq!(reason, "deferred"),
            _ => panic!("expected queued/skipped outcome"),
        }
    }

    #[test]
    fn force_open_all_operations_rejects_never_dispatched_operation() {
        let (_registry, id) = registry_with("weather-1");
        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());

        assert!(manager.is_call_allowed(&id, "get_marine_forecast"), "no breaker yet, defaults open for calls");
        manager.force_open_all_operations(&id);
        assert!(
            !manager.is_call_allowed(&id, "get_marine_forecast"),
            "an operation never dispatched before must still be rejected once the agent is forced open"
        );
    }

    #[tokio::test]
    async fn alternative_agent_used_when_primary_circuit_open() {
        let (registry, primary) = registry_with("weather-1");
        let alt = AgentId::parse("weather-2").unwrap();
        registry.register(AgentDescriptor {
            agent_id: alt.clone(),
            display_name: "weather-2".into(),
            version: "1.0".into(),
            base_endpoint: "http://weather-2".into(),
            capabilities: vec![Capability::new("get_marine_forecast")],
            health_endpoint: "http://weather-2/health".into(),
        });
        registry.update_status(&alt, crate::types::AgentStatus::Active, None);

        let manager = FallbackManager::new(BreakerConfig::default(), CacheConfig::default());
        manager.breaker_for(&primary, "get_marine_forecast").force_open();

        let client = ScriptedClient { failures_before_success: AtomicU32::new(0), kind: ErrorKind::Transient };
        let outcome = manager
            .dispatch(&[primary, alt.clone()], "get_marine_forecast", "weather", serde_json::json!({}), Duration::from_secs(1), Duration::from_secs(300), &registry, &client)
            .await;
        match outcome.result {
            StepResult::Ok { source_agent_id, fallback, .. } => {
                assert_eq!(source_agent_id, alt);
                assert!(fallback);
            }
            _ => panic!("expected alternative agent success"),
        }
    }
}
