//! Agent Discovery: populates the Registry from three merged sources and
//! watches for capability drift.

use crate::agent_client::{AgentClient, CapabilitiesPayload};
use crate::events::PlanEvent;
use crate::registry::AgentRegistry;
use crate::types::{AgentDescriptor, Capability};
use orchestrator_core::AgentId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A statically configured agent entry: id and base URL.
#[derive(Debug, Clone)]
pub struct StaticAgentEntry {
    pub agent_id: String,
    pub base_url: String,
}

/// Optional pluggable service-discovery backend. Sources are merged in
/// order, later sources overriding on conflicting agent ids: static table,
/// then `AGENT_URLS`, then this backend.
#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn list_agents(&self) -> Vec<StaticAgentEntry>;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub drift_check_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            drift_check_interval: Duration::from_secs(300),
        }
    }
}

/// A built-in fallback capability table used when `/capabilities` is
/// unreachable but `/health` responds, synthesized from a recognizable
/// prefix in the agent id.
fn builtin_capabilities_for(agent_id: &str) -> Vec<&'static str> {
    if agent_id.contains("weather") {
        vec!["get_marine_forecast"]
    } else if agent_id.contains("wind") {
        vec!["analyze_wind"]
    } else if agent_id.contains("tide") {
        vec!["get_tide_predictions"]
    } else if agent_id.contains("route") {
        vec!["calculate_route"]
    } else if agent_id.contains("port") {
        vec!["get_port_info"]
    } else if agent_id.contains("safety") {
        vec!["check_safety"]
    } else {
        vec![]
    }
}

pub struct DiscoveryService<C: AgentClient> {
    registry: Arc<AgentRegistry>,
    client: Arc<C>,
    config: DiscoveryConfig,
    backend: Option<Arc<dyn DiscoveryBackend>>,
    /// Last known capability signature per agent id, used to detect drift.
    known_signatures: tokio::sync::RwLock<HashMap<AgentId, (String, Vec<String>)>>,
}

impl<C: AgentClient + 'static> DiscoveryService<C> {
    pub fn new(registry: Arc<AgentRegistry>, client: Arc<C>, config: DiscoveryConfig) -> Self {
        Self {
            registry,
            client,
            config,
            backend: None,
            known_signatures: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn DiscoveryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Parse `AGENT_URLS` of `id=url` pairs separated by commas.
    pub fn parse_agent_urls_env(value: &str) -> Vec<StaticAgentEntry> {
        value
            .split(',')
            .filter_map(|pair| {
                let (id, url) = pair.split_once('=')?;
                let id = id.trim();
                let url = url.trim();
                if id.is_empty() || url.is_empty() {
                    return None;
                }
                Some(StaticAgentEntry {
                    agent_id: id.to_string(),
                    base_url: url.to_string(),
                })
            })
            .collect()
    }

    /// Merge the three sources, later overriding earlier on matching id.
    pub async fn merged_entries(&self, static_table: &[StaticAgentEntry]) -> Vec<StaticAgentEntry> {
        let mut merged: HashMap<String, StaticAgentEntry> = HashMap::new();
        for entry in static_table {
            merged.insert(entry.agent_id.clone(), entry.clone());
        }
        if let Ok(value) = std::env::var("AGENT_URLS") {
            for entry in Self::parse_agent_urls_env(&value) {
                merged.insert(entry.agent_id.clone(), entry);
            }
        }
        if let Some(backend) = &self.backend {
            for entry in backend.list_agents().await {
                merged.insert(entry.agent_id.clone(), entry);
            }
        }
        merged.into_values().collect()
    }

    /// Probe one entry, register whatever is discovered, and remember its
    /// signature for drift detection. Never removes an agent on failure.
    async fn probe_and_register(&self, entry: &StaticAgentEntry) {
        let Ok(agent_id) = AgentId::parse(&entry.agent_id) else {
            return;
        };

        let descriptor = match self.client.capabilities(&entry.base_url).await {
            Ok(payload) => payload.into_descriptor(agent_id.clone(), entry.base_url.clone()),
            Err(_) => match self.client.health(&entry.base_url).await {
                Ok(_) => AgentDescriptor {
                    agent_id: agent_id.clone(),
                    display_name: entry.agent_id.clone(),
                    version: "unknown".to_string(),
                    base_endpoint: entry.base_url.clone(),
                    capabilities: builtin_capabilities_for(&entry.agent_id)
                        .into_iter()
                        .map(Capability::new)
                        .collect(),
                    health_endpoint: format!("{}/health", entry.base_url),
                },
                Err(e) => {
                    debug!(agent = %entry.agent_id, error = %e, "probe failed on both capabilities and health, leaving prior state");
                    return;
                }
            },
        };

        let signature = (
            descriptor.version.clone(),
            {
                let mut ops: Vec<String> = descriptor.capabilities.iter().map(|c| c.operation.clone()).collect();
                ops.sort();
                ops
            },
        );

        let mut known = self.known_signatures.write().await;
        let drifted = known
            .get(&agent_id)
            .map(|prev| prev != &signature)
            .unwrap_or(false);
        let is_new = !known.contains_key(&agent_id);
        known.insert(agent_id.clone(), signature);
        drop(known);

        self.registry.register(descriptor);
        if drifted {
            warn!(agent = %agent_id, "capability drift detected");
            self.registry.events().emit(PlanEvent::AgentUpdated { agent_id });
        } else if is_new {
            // register() already emitted AgentRegistered.
        }
    }

    pub async fn run_once(&self, static_table: &[StaticAgentEntry]) {
        for entry in self.merged_entries(static_table).await {
            self.probe_and_register(&entry).await;
        }
    }

    /// Spawn the five-minute drift-check loop. Returns a handle the host can
    /// use to stop it.
    pub fn start_drift_watcher(self: &Arc<Self>, static_table: Vec<StaticAgentEntry>) -> BackgroundTaskHandle {
        let service = Arc::clone(self);
        let interval_period = self.config.drift_check_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                info!(agents = static_table.len(), "running drift check");
                service.run_once(&static_table).await;
            }
        });
        BackgroundTaskHandle { handle }
    }
}

pub struct BackgroundTaskHandle {
    handle: JoinHandle<()>,
}

impl BackgroundTaskHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::HealthPayload;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubClient {
        capabilities_ok: bool,
        health_ok: bool,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl AgentClient for StubClient {
        async fn health(&self, _base: &str) -> orchestrator_core::OrchestrationResult<HealthPayload> {
            if self.health_ok {
                Ok(HealthPayload { status: "healthy".into() })
            } else {
                Err(orchestrator_core::OrchestrationError::new(orchestrator_core::ErrorKind::Unreachable, "down"))
            }
        }

        async fn capabilities(&self, _base: &str) -> orchestrator_core::OrchestrationResult<CapabilitiesPayload> {
            *self.calls.lock().unwrap() += 1;
            if self.capabilities_ok {
                Ok(CapabilitiesPayload {
                    name: "weather".into(),
                    version: "1.0".into(),
                    description: String::new(),
                    tools: vec![],
                })
            } else {
                Err(orchestrator_core::OrchestrationError::new(orchestrator_core::ErrorKind::Unreachable, "down"))
            }
        }

        async fn execute(
            &self,
            _base: &str,
            _op: &str,
            _input: serde_json::Value,
            _deadline: Duration,
        ) -> orchestrator_core::OrchestrationResult<serde_json::Value> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn registers_agent_via_capabilities_probe() {
        let registry = Arc::new(AgentRegistry::new());
        let client = Arc::new(StubClient { capabilities_ok: true, health_ok: true, calls: Mutex::new(0) });
        let service = DiscoveryService::new(registry.clone(), client, DiscoveryConfig::default());
        service
            .run_once(&[StaticAgentEntry { agent_id: "weather-1".into(), base_url: "http://x".into() }])
            .await;
        assert!(registry.lookup(&AgentId::parse("weather-1").unwrap()).is_some());
    }

    #[tokio::test]
    async fn synthesizes_descriptor_when_only_health_reachable() {
        let registry = Arc::new(AgentRegistry::new());
        let client = Arc::new(StubClient { capabilities_ok: false, health_ok: true, calls: Mutex::new(0) });
        let service = DiscoveryService::new(registry.clone(), client, DiscoveryConfig::default());
        service
            .run_once(&[StaticAgentEntry { agent_id: "weather-1".into(), base_url: "http://x".into() }])
            .await;
        let descriptor = registry.lookup(&AgentId::parse("weather-1").unwrap()).unwrap();
        assert!(descriptor.supports("get_marine_forecast"));
    }

    #[tokio::test]
    async fn never_removes_agent_on_single_failed_probe() {
        let registry = Arc::new(AgentRegistry::new());
        let client = Arc::new(StubClient { capabilities_ok: true, health_ok: true, calls: Mutex::new(0) });
        let service = DiscoveryService::new(registry.clone(), client, DiscoveryConfig::default());
        let entries = [StaticAgentEntry { agent_id: "weather-1".into(), base_url: "http://x".into() }];
        service.run_once(&entries).await;

        let failing_client = Arc::new(StubClient { capabilities_ok: false, health_ok: false, calls: Mutex::new(0) });
        let service2 = DiscoveryService::new(registry.clone(), failing_client, DiscoveryConfig::default());
        service2.run_once(&entries).await;

        assert!(registry.lookup(&AgentId::parse("weather-1").unwrap()).is_some());
    }

    #[test]
    fn parses_agent_urls_env_format() {
        let entries = DiscoveryService::<crate::agent_client::HttpAgentClient>::parse_agent_urls_env(
            "weather=http://weather:8080,route=http://route:8081",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].agent_id, "weather");
    }

    #[tokio::test]
    async fn later_sources_override_static_table_on_conflict() {
        let registry = Arc::new(AgentRegistry::new());
        let client = Arc::new(StubClient { capabilities_ok: true, health_ok: true, calls: Mutex::new(0) });
        let service = DiscoveryService::new(registry, client, DiscoveryConfig::default());
        unsafe {
            std::env::set_var("AGENT_URLS", "weather-1=http://override:9999");
        }
        let merged = service
            .merged_entries(&[StaticAgentEntry { agent_id: "weather-1".into(), base_url: "http://static:1111".into() }])
            .await;
        unsafe {
            std::env::remove_var("AGENT_URLS");
        }
        assert_eq!(merged[0].base_url, "http://override:9999");
    }
}
