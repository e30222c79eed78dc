//! Passage-planning orchestration: agent registry, discovery, health
//! monitoring, routing, fallback handling and response aggregation.
//!
//! [`Orchestrator`] is the caller-facing facade: `submit`, `event_stream`,
//! `await_plan`, `cancel`. Wiring discovery and health-monitor background
//! loops against a concrete [`AgentClient`] is left to the host, since their
//! static agent table and refresh cadence are deployment concerns.

pub mod agent_client;
pub mod aggregator;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod events;
pub mod fallback;
pub mod health;
pub mod registry;
pub mod router;
pub mod types;

pub use agent_client::{AgentClient, HttpAgentClient};
pub use aggregator::ResponseAggregator;
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cache::{CacheConfig, CacheKey, ResponseCache};
pub use config::OrchestratorConfig;
pub use coordinator::{CoordinatorConfig, RunOutcome, WorkflowCoordinator};
pub use discovery::{DiscoveryBackend, DiscoveryConfig, DiscoveryService, StaticAgentEntry};
pub use events::{EventBus, PlanEvent};
pub use fallback::FallbackManager;
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use registry::AgentRegistry;
pub use router::{RequestRouter, RouterConfig};
pub use types::*;

use orchestrator_core::PlanId;
use orchestrator_observability::OrchestrationMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::warn;

struct PlanSlot {
    cancel: Arc<AtomicBool>,
    receiver: AsyncMutex<Option<oneshot::Receiver<AggregatedPlan>>>,
}

/// The caller-facing orchestration surface. One instance owns one registry,
/// one fallback manager, and one coordinator; submitted plans run as
/// independent background tasks against a shared agent client.
pub struct Orchestrator<C: AgentClient + 'static> {
    registry: Arc<AgentRegistry>,
    fallback: Arc<FallbackManager>,
    router: RequestRouter,
    coordinator: Arc<WorkflowCoordinator<C>>,
    plans: AsyncMutex<HashMap<PlanId, PlanSlot>>,
}

impl<C: AgentClient + 'static> Orchestrator<C> {
    pub fn new(client: Arc<C>, config: OrchestratorConfig) -> Self {
        let metrics = match OrchestrationMetrics::new(prometheus::default_registry(), "orchestrator") {
            Ok(m) => Some(Arc::new(m)),
            Err(e) => {
                warn!(error = %e, "metrics registration failed, running without metrics");
                None
            }
        };

        let registry = Arc::new(AgentRegistry::new());
        let mut fallback = FallbackManager::new(config.breaker, config.cache);
        if let Some(metrics) = &metrics {
            fallback = fallback.with_metrics(Arc::clone(metrics));
        }
        let fallback = Arc::new(fallback);
        let router = RequestRouter::new(Arc::clone(&registry), config.router);
        let mut coordinator = WorkflowCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&fallback),
            client,
            config.coordinator,
        );
        if let Some(metrics) = &metrics {
            coordinator = coordinator.with_metrics(Arc::clone(metrics));
        }
        let coordinator = Arc::new(coordinator);

        Self {
            registry,
            fallback,
            router,
            coordinator,
            plans: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn fallback(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    /// Subscribe to the plan event stream. Events for every in-flight plan
    /// share one bus; callers filter by the `plan_id` field each variant
    /// carries.
    pub fn event_stream(&self) -> tokio::sync::broadcast::Receiver<PlanEvent> {
        self.registry.events().subscribe()
    }

    /// Route the request into an `ExecutionPlan` and run it as a detached
    /// task. Returns immediately with the plan id.
    pub async fn submit(&self, request: PassageRequest) -> PlanId {
        let request_for_aggregation = request.clone();
        let plan = self.router.route(request);
        let plan_id = plan.plan_id.clone();

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let coordinator = Arc::clone(&self.coordinator);
        let cancel_for_task = Arc::clone(&cancel);
        tokio::spawn(async move {
            let outcome = coordinator.run(plan, cancel_for_task).await;
            let aggregated = ResponseAggregator::aggregate(&outcome.plan, &outcome.results, request_for_aggregation);
            let _ = tx.send(aggregated);
        });

        self.plans.lock().await.insert(
            plan_id.clone(),
            PlanSlot {
                cancel,
                receiver: AsyncMutex::new(Some(rx)),
            },
        );
        plan_id
    }

    /// Block until the plan completes (or was already awaited, in which
    /// case this returns `None`).
    pub async fn await_plan(&self, plan_id: &PlanId) -> Option<AggregatedPlan> {
        let receiver = {
            let plans = self.plans.lock().await;
            let slot = plans.get(plan_id)?;
            slot.receiver.lock().await.take()
        }?;
        receiver.await.ok()
    }

    /// Request cancellation. The Coordinator stops admitting new steps at
    /// its next scheduling tick and marks the rest `skipped(cancelled)`.
    pub async fn cancel(&self, plan_id: &PlanId) {
        if let Some(slot) = self.plans.lock().await.get(plan_id) {
            slot.cancel.store(true, Ordering::SeqCst);
        }
    }
}
