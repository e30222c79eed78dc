//! Workflow Coordinator: runs an `ExecutionPlan` against live agents.
//!
//! Maintains a ready-set of steps whose dependencies are all terminal and
//! usable, dispatches up to `W` concurrently via the Fallback Manager, and
//! performs lazy per-waypoint fan-out once the `route` step resolves.

use crate::agent_client::AgentClient;
use crate::events::{EventBus, PlanEvent};
use crate::fallback::FallbackManager;
use crate::registry::AgentRegistry;
use crate::types::{AgentSelector, ExecutionPlan, InputTemplate, Step, StepResult, WorkflowContext};
use orchestrator_core::{AgentId, ErrorKind, StepId};
use orchestrator_observability::OrchestrationMetrics;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// W: global concurrent-step cap.
    pub concurrency: usize,
    /// Per-plan cap on in-flight fan-out sub-steps.
    pub fanout_cap: usize,
    pub retry_initial_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_cap: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            fanout_cap: 4,
            retry_initial_delay: Duration::from_secs(1),
            retry_multiplier: 2.0,
            retry_cap: Duration::from_secs(10),
        }
    }
}

fn backoff_delay(attempt: u32, config: &CoordinatorConfig) -> Duration {
    let scaled = config.retry_initial_delay.mul_f64(config.retry_multiplier.powi(attempt as i32));
    scaled.min(config.retry_cap)
}

pub struct WorkflowCoordinator<C: AgentClient> {
    registry: Arc<AgentRegistry>,
    fallback: Arc<FallbackManager>,
    client: Arc<C>,
    config: CoordinatorConfig,
    metrics: Option<Arc<OrchestrationMetrics>>,
}

/// Result of running a plan to completion (or to cancellation/deadline).
pub struct RunOutcome {
    pub plan: ExecutionPlan,
    pub results: HashMap<StepId, StepResult>,
    pub cancelled: bool,
}

fn resolve_candidates(step: &Step, registry: &AgentRegistry) -> Vec<AgentId> {
    match &step.selector {
        AgentSelector::Fixed(id) => {
            let mut candidates = vec![id.clone()];
            if let Some(fb) = &step.fallback_agent {
                if fb != id {
                    candidates.push(fb.clone());
                }
            }
            candidates
        }
        AgentSelector::AnyCapable => registry.select_by_capability(&step.operation),
    }
}

fn materialize_input(template: &InputTemplate, results: &HashMap<StepId, StepResult>) -> serde_json::Value {
    let mut map = template.static_values.clone();
    for (field, dep_id, pointer) in &template.references {
        if let Some(StepResult::Ok { payload, .. }) = results.get(dep_id) {
            if let Some(value) = payload.pointer(pointer) {
                map.insert(field.clone(), value.clone());
            }
        }
    }
    serde_json::Value::Object(map)
}

/// Build the per-waypoint fan-out children for a weather template step once
/// its route dependency has resolved. Waypoint count comes from the route
/// output's `waypoints` array; absent or non-array output fans out to one
/// sub-step so the plan still produces a result.
fn expand_fan_out(template: &Step, route_output: &serde_json::Value) -> Vec<Step> {
    let count = route_output
        .get("waypoints")
        .and_then(|w| w.as_array())
        .map(|arr| arr.len().max(1))
        .unwrap_or(1);

    (0..count)
        .map(|idx| Step {
            id: StepId::new_unchecked(format!("{}_wp_{idx}", template.id.as_str())),
            capability: template.capability,
            operation: template.operation.clone(),
            selector: template.selector.clone(),
            fallback_agent: template.fallback_agent.clone(),
            depends_on: template.depends_on.clone(),
            input: template.input.clone(),
            timeout: template.timeout,
            retry_budget: template.retry_budget,
            fan_out_of: Some(template.id.clone()),
            waypoint_index: Some(idx),
        })
        .collect()
}

impl<C: AgentClient + 'static> WorkflowCoordinator<C> {
    pub fn new(registry: Arc<AgentRegistry>, fallback: Arc<FallbackManager>, client: Arc<C>, config: CoordinatorConfig) -> Self {
        Self { registry, fallback, client, config, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<OrchestrationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn events(&self) -> &EventBus {
        self.registry.events()
    }

    async fn execute_step(
        fallback: Arc<FallbackManager>,
        registry: Arc<AgentRegistry>,
        client: Arc<C>,
        config: CoordinatorConfig,
        step: Step,
        input: serde_json::Value,
    ) -> (StepId, StepResult, bool, Option<&'static str>) {
        let candidates = resolve_candidates(&step, &registry);
        let capability_key = step.capability.operation_name();
        let cache_ttl = step.capability.cache_ttl();
        let mut retries_left = step.retry_budget;
        let mut attempt = 0u32;

        loop {
            let outcome = fallback
                .dispatch(&candidates, &step.operation, capability_key, input.clone(), step.timeout, cache_ttl, &registry, client.as_ref())
                .await;

            let is_timeout = matches!(&outcome.result, StepResult::Error { kind, .. } if *kind == ErrorKind::Timeout);
            if is_timeout && retries_left > 0 {
                let delay = backoff_delay(attempt, &config);
                tokio::time::sleep(delay).await;
                retries_left -= 1;
                attempt += 1;
                continue;
            }

            let fallback_used = matches!(&outcome.result, StepResult::Ok { fallback, .. } if *fallback);
            return (step.id, outcome.result, fallback_used, outcome.strategy);
        }
    }

    /// Run the plan to completion, cancellation, or deadline. `cancel` may be
    /// flipped by the caller at any time from another task.
    pub async fn run(&self, plan: ExecutionPlan, cancel: Arc<AtomicBool>) -> RunOutcome {
        let plan_id = plan.plan_id.clone();
        let plan_started = Instant::now();
        info!(plan = %plan_id, steps = plan.steps.len(), "plan started");
        self.events().emit(PlanEvent::PlanStarted { plan_id: plan_id.clone() });
        if let Some(metrics) = &self.metrics {
            metrics.record_plan_started();
        }

        let mut ctx = WorkflowContext::new(plan_id.clone());
        let mut all_steps: HashMap<StepId, Step> = plan.steps.iter().cloned().map(|s| (s.id.clone(), s)).collect();
        let mut pending: HashSet<StepId> = all_steps.keys().cloned().collect();
        let mut expanded: HashSet<StepId> = HashSet::new();
        let mut extra_steps: Vec<Step> = Vec::new();

        let deadline_at = Instant::now() + plan.deadline;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let fanout_semaphore = Arc::new(Semaphore::new(self.config.fanout_cap.max(1)));
        let mut in_flight: JoinSet<(StepId, StepResult, bool, Option<&'static str>)> = JoinSet::new();

        loop {
            if cancel.load(Ordering::SeqCst) || Instant::now() >= deadline_at {
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
                for step_id in pending.drain() {
                    ctx.results.insert(step_id, StepResult::Skipped { reason: "cancelled".to_string() });
                }
                ctx.cancelled = true;
                warn!(plan = %plan_id, "plan cancelled or deadline exceeded");
                self.events().emit(PlanEvent::PlanCancelled { plan_id: plan_id.clone() });
                break;
            }

            // Propagate skip to steps whose dependency already resolved unusable.
            let to_skip: Vec<StepId> = pending
                .iter()
                .filter(|id| {
                    let step = &all_steps[*id];
                    step.depends_on.iter().any(|d| matches!(ctx.results.get(d), Some(r) if !r.is_usable()))
                })
                .cloned()
                .collect();
            for id in to_skip {
                pending.remove(&id);
                ctx.results.insert(id, StepResult::Skipped { reason: "upstream_failure".to_string() });
            }

            // Lazy fan-out expansion: templates whose single dependency has
            // resolved usable and which haven't been expanded yet.
            let to_expand: Vec<StepId> = pending
                .iter()
                .filter(|id| {
                    let step = &all_steps[*id];
                    step.fan_out_of.is_some()
                        && step.waypoint_index.is_none()
                        && !expanded.contains(*id)
                        && step.depends_on.iter().all(|d| matches!(ctx.results.get(d), Some(r) if r.is_usable()))
                })
                .cloned()
                .collect();
            for template_id in to_expand {
                let template = all_steps[&template_id].clone();
                let route_output = template
                    .depends_on
                    .first()
                    .and_then(|dep| ctx.results.get(dep))
                    .and_then(|r| match r {
                        StepResult::Ok { payload, .. } => Some(payload.clone()),
                        _ => None,
                    })
                    .unwrap_or(serde_json::Value::Null);

                let children = expand_fan_out(&template, &route_output);
                for child in &children {
                    all_steps.insert(child.id.clone(), child.clone());
                    pending.insert(child.id.clone());
                }
                extra_steps.extend(children);
                pending.remove(&template_id);
                expanded.insert(template_id);
            }

            let ready: Vec<StepId> = pending
                .iter()
                .filter(|id| {
                    let step = &all_steps[*id];
                    step.depends_on.iter().all(|d| matches!(ctx.results.get(d), Some(r) if r.is_usable()))
                })
                .cloned()
                .collect();

            if ready.is_empty() && in_flight.is_empty() {
                break;
            }

            for step_id in ready {
                let step = all_steps[&step_id].clone();
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let fanout_permit = if step.fan_out_of.is_some() && step.waypoint_index.is_some() {
                    match Arc::clone(&fanout_semaphore).try_acquire_owned() {
                        Ok(p) => Some(p),
                        Err(_) => continue,
                    }
                } else {
                    None
                };

                pending.remove(&step_id);
                self.events().emit(PlanEvent::StepStarted { plan_id: plan_id.clone(), step_id: step_id.clone() });

                let input = materialize_input(&step.input, &ctx.results);
                let fallback = Arc::clone(&self.fallback);
                let registry = Arc::clone(&self.registry);
                let client = Arc::clone(&self.client);
                let config = self.config.clone();

                in_flight.spawn(async move {
                    let _permit = permit;
                    let _fanout_permit = fanout_permit;
                    Self::execute_step(fallback, registry, client, config, step, input).await
                });
            }

            if !in_flight.is_empty() {
                if let Some(joined) = in_flight.join_next().await {
                    match joined {
                        Ok((step_id, result, fallback_used, strategy)) => {
                            match &result {
                                StepResult::Ok { latency, .. } => {
                                    self.events().emit(PlanEvent::StepCompleted {
                                        plan_id: plan_id.clone(),
                                        step_id: step_id.clone(),
                                        latency: *latency,
                                        fallback: fallback_used,
                                    });
                                }
                                StepResult::Error { message, .. } => {
                                    self.events().emit(PlanEvent::StepFailed {
                                        plan_id: plan_id.clone(),
                                        step_id: step_id.clone(),
                                        message: message.clone(),
                                    });
                                }
                                StepResult::Skipped { .. } if strategy == Some("queue") => {
                                    self.events().emit(PlanEvent::RequestQueued {
                                        plan_id: plan_id.clone(),
                                        step_id: step_id.clone(),
                                        queue_id: format!("{}-{}", plan_id.as_str(), step_id.as_str()),
                                    });
                                }
                                StepResult::Skipped { .. } => {}
                            }
                            ctx.results.insert(step_id, result);
                        }
                        Err(_join_err) => {
                            // Aborted (cancellation) or panicked; loop will
                            // re-evaluate cancellation/deadline on next tick.
                        }
                    }
                }
            }
        }

        let outcome_label = if ctx.cancelled {
            "cancelled"
        } else if ctx.results.values().any(|r| matches!(r, StepResult::Error { .. })) {
            warn!(plan = %plan_id, "plan finished with one or more failed steps");
            self.events().emit(PlanEvent::PlanFailed {
                plan_id: plan_id.clone(),
                error: "one or more steps failed".to_string(),
            });
            "failed"
        } else {
            info!(plan = %plan_id, "plan completed");
            self.events().emit(PlanEvent::PlanCompleted { plan_id: plan_id.clone() });
            "completed"
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_plan_finished(outcome_label, plan_started.elapsed());
        }

        let mut final_steps = plan.steps;
        final_steps.extend(extra_steps);
        let final_plan = ExecutionPlan {
            plan_id: plan.plan_id,
            request_id: plan.request_id,
            user_id: plan.user_id,
            steps: final_steps,
            created_at: plan.created_at,
            deadline: plan.deadline,
            slot_map: plan.slot_map,
        };

        RunOutcome { plan: final_plan, results: ctx.results, cancelled: ctx.cancelled }
    }
}
