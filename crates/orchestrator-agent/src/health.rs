//! Health Monitor: periodically probes agents, updates their status, and
//! drives circuit breakers on persistent failure.

use crate::agent_client::AgentClient;
use crate::events::PlanEvent;
use crate::fallback::FallbackManager;
use crate::registry::AgentRegistry;
use crate::types::AgentStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

const HEALTH_PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub probe_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
        }
    }
}

pub struct HealthMonitor<C: AgentClient> {
    registry: Arc<AgentRegistry>,
    fallback: Arc<FallbackManager>,
    client: Arc<C>,
    config: HealthMonitorConfig,
}

impl<C: AgentClient + 'static> HealthMonitor<C> {
    pub fn new(
        registry: Arc<AgentRegistry>,
        fallback: Arc<FallbackManager>,
        client: Arc<C>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            fallback,
            client,
            config,
        }
    }

    /// Probe one agent. A probe fails when the call raises, returns a
    /// non-healthy status, or exceeds the 5 s deadline.
    pub async fn probe_one(&self, agent_id: &orchestrator_core::AgentId) {
        let Some(descriptor) = self.registry.lookup(agent_id) else {
            return;
        };

        let outcome = tokio::time::timeout(HEALTH_PROBE_DEADLINE, self.client.health(&descriptor.base_endpoint)).await;
        let success = matches!(outcome, Ok(Ok(payload)) if payload.status == "healthy");

        let Some(new_status) = self.registry.record_health_probe(agent_id, success) else {
            return;
        };

        match new_status {
            AgentStatus::Active => {
                self.fallback.credit_health_success(agent_id);
                self.registry.events().emit(PlanEvent::AgentHealthy { agent_id: agent_id.clone() });
            }
            AgentStatus::Error => {
                warn!(agent = %agent_id, "health probe failed, forcing breakers open");
                self.fallback.force_open_all_operations(agent_id);
                self.registry.events().emit(PlanEvent::AgentUnhealthy { agent_id: agent_id.clone() });
            }
            _ => {}
        }
    }

    pub async fn probe_all(&self) {
        for agent_id in self.registry.all_agent_ids() {
            self.probe_one(&agent_id).await;
        }
    }

    pub fn start(self: Arc<Self>) -> BackgroundTaskHandle {
        let interval_period = self.config.probe_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            loop {
                interval.tick().await;
                self.probe_all().await;
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
