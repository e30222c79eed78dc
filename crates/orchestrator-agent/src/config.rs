//! Environment-sourced configuration. Every `ORCH_*` variable is optional
//! and falls back to the defaults named throughout the core; a malformed
//! value is logged and ignored rather than panicking the process.

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::coordinator::CoordinatorConfig;
use crate::discovery::{DiscoveryConfig, StaticAgentEntry};
use crate::health::HealthMonitorConfig;
use crate::router::RouterConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub static_agents: Vec<StaticAgentEntry>,
    pub router: RouterConfig,
    pub coordinator: CoordinatorConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub health: HealthMonitorConfig,
    pub discovery: DiscoveryConfig,
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

impl OrchestratorConfig {
    /// Build a config from `ORCH_*` / `AGENT_URLS` environment variables,
    /// falling back to the documented defaults for anything absent or
    /// unparsable.
    pub fn from_env() -> Self {
        let defaults = CoordinatorConfig::default();
        let coordinator = CoordinatorConfig {
            concurrency: env_u64("ORCH_CONCURRENCY").map(|v| v as usize).unwrap_or(defaults.concurrency),
            fanout_cap: env_u64("ORCH_FANOUT_CAP").map(|v| v as usize).unwrap_or(defaults.fanout_cap),
            retry_initial_delay: env_u64("ORCH_RETRY_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_initial_delay),
            retry_multiplier: env_f64("ORCH_RETRY_MULTIPLIER").unwrap_or(defaults.retry_multiplier),
            retry_cap: env_u64("ORCH_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_cap),
        };

        let router_defaults = RouterConfig::default();
        let router = RouterConfig {
            default_retry_budget: env_u64("ORCH_RETRY_MAX_ATTEMPTS")
                .map(|v| v as u32)
                .unwrap_or(router_defaults.default_retry_budget),
            step_timeout_override: env_u64("ORCH_STEP_TIMEOUT_SECS").map(Duration::from_secs),
        };

        let breaker_defaults = BreakerConfig::default();
        let breaker = BreakerConfig {
            failure_threshold: env_u64("ORCH_BREAKER_FAILURE_THRESHOLD")
                .map(|v| v as u32)
                .unwrap_or(breaker_defaults.failure_threshold),
            reset_timeout: env_u64("ORCH_BREAKER_RESET_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(breaker_defaults.reset_timeout),
            half_open_success_threshold: breaker_defaults.half_open_success_threshold,
            half_open_requests: env_u64("ORCH_BREAKER_HALF_OPEN_PROBES")
                .map(|v| v as u32)
                .unwrap_or(breaker_defaults.half_open_requests),
        };

        let cache = CacheConfig {
            enabled: env_bool("ORCH_CACHE_ENABLED").unwrap_or(true),
        };

        let health = HealthMonitorConfig {
            probe_interval: env_u64("ORCH_HEALTH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
        };

        let discovery = DiscoveryConfig {
            drift_check_interval: env_u64("ORCH_DISCOVERY_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
        };

        let static_agents = std::env::var("AGENT_URLS")
            .ok()
            .map(|v| crate::discovery::DiscoveryService::<crate::agent_client::HttpAgentClient>::parse_agent_urls_env(&v))
            .unwrap_or_default();

        Self { static_agents, router, coordinator, breaker, cache, health, discovery }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            static_agents: Vec::new(),
            router: RouterConfig::default(),
            coordinator: CoordinatorConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            health: HealthMonitorConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}
