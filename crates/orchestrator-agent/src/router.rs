//! Request Router: turns a `PassageRequest` into a dependency-ordered
//! `ExecutionPlan`.

use crate::registry::AgentRegistry;
use crate::types::{
    AgentSelector, CapabilityClass, ExecutionPlan, InputTemplate, PassageRequest, Step,
};
use orchestrator_core::{AgentId, PlanId, StepId};
use std::collections::HashMap;
use std::time::Duration;

/// Budgets applied uniformly to every generated step.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_retry_budget: u32,
    /// Overrides every capability class's built-in step timeout when set.
    pub step_timeout_override: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { default_retry_budget: 2, step_timeout_override: None }
    }
}

pub struct RequestRouter {
    registry: std::sync::Arc<AgentRegistry>,
    config: RouterConfig,
}

/// The default passage-planning capability set. A narrower prompt (e.g.
/// "weather only") restricts this set; capability extraction from free text
/// is intentionally simple and conservative, per the core's scope (it does
/// not implement NLU).
fn default_capability_set() -> Vec<CapabilityClass> {
    vec![
        CapabilityClass::Ports,
        CapabilityClass::Route,
        CapabilityClass::Weather,
        CapabilityClass::Wind,
        CapabilityClass::Tides,
        CapabilityClass::Safety,
    ]
}

fn extract_capabilities(prompt: Option<&str>) -> Vec<CapabilityClass> {
    let Some(prompt) = prompt else {
        return default_capability_set();
    };
    let lower = prompt.to_lowercase();
    let narrow: Vec<(&str, CapabilityClass)> = vec![
        ("weather", CapabilityClass::Weather),
        ("wind", CapabilityClass::Wind),
        ("tide", CapabilityClass::Tides),
        ("route", CapabilityClass::Route),
        ("port", CapabilityClass::Ports),
        ("safety", CapabilityClass::Safety),
    ];
    let matched: Vec<CapabilityClass> = narrow
        .into_iter()
        .filter(|(kw, _)| lower.contains(kw))
        .map(|(_, class)| class)
        .collect();
    if matched.is_empty() {
        default_capability_set()
    } else {
        matched
    }
}

impl RequestRouter {
    pub fn new(registry: std::sync::Arc<AgentRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    fn step_id_for(class: CapabilityClass) -> StepId {
        let name = match class {
            CapabilityClass::Ports => "ports",
            CapabilityClass::Route => "route",
            CapabilityClass::Weather => "weather",
            CapabilityClass::Wind => "wind",
            CapabilityClass::Tides => "tides",
            CapabilityClass::Safety => "safety",
            CapabilityClass::Opaque => "opaque",
        };
        StepId::new_unchecked(name)
    }

    fn deps_for(class: CapabilityClass, present: &[CapabilityClass]) -> Vec<StepId> {
        let has = |c: CapabilityClass| present.contains(&c);
        match class {
            CapabilityClass::Ports => vec![],
            CapabilityClass::Route => {
                if has(CapabilityClass::Ports) {
                    vec![Self::step_id_for(CapabilityClass::Ports)]
                } else {
                    vec![]
                }
            }
            CapabilityClass::Weather | CapabilityClass::Wind | CapabilityClass::Safety => {
                if has(CapabilityClass::Route) {
                    vec![Self::step_id_for(CapabilityClass::Route)]
                } else {
                    vec![]
                }
            }
            CapabilityClass::Tides => {
                if has(CapabilityClass::Ports) {
                    vec![Self::step_id_for(CapabilityClass::Ports)]
                } else {
                    vec![]
                }
            }
            CapabilityClass::Opaque => vec![],
        }
    }

    /// Produce the same plan (same step ids, dependencies, agent
    /// assignments, budgets) for a fixed request and fixed registry state.
    pub fn route(&self, request: PassageRequest) -> ExecutionPlan {
        let capabilities = extract_capabilities(request.prompt.as_deref());
        let mut steps = Vec::new();
        let mut slot_map = HashMap::new();

        for class in &capabilities {
            let operation = class.operation_name();
            let mut candidates = self.registry.select_by_capability(operation);
            let primary = if candidates.is_empty() {
                AgentSelector::AnyCapable
            } else {
                AgentSelector::Fixed(candidates.remove(0))
            };
            let fallback_agent: Option<AgentId> = if candidates.is_empty() { None } else { Some(candidates.remove(0)) };

            let step_id = Self::step_id_for(*class);
            let step = Step {
                id: step_id.clone(),
                capability: *class,
                operation: operation.to_string(),
                selector: primary,
                fallback_agent,
                depends_on: Self::deps_for(*class, &capabilities),
                input: InputTemplate::default(),
                timeout: self.config.step_timeout_override.unwrap_or_else(|| class.step_timeout()),
                retry_budget: self.config.default_retry_budget,
                fan_out_of: None,
                waypoint_index: None,
            };
            steps.push(step);

            let slot_name = match class {
                CapabilityClass::Ports => "ports",
                CapabilityClass::Route => "route",
                CapabilityClass::Weather => "weather",
                CapabilityClass::Wind => "wind",
                CapabilityClass::Tides => "tides",
                CapabilityClass::Safety => "safety",
                CapabilityClass::Opaque => "opaque",
            };
            slot_map.insert(slot_name.to_string(), step_id);
        }

        // Fan-out placeholder: the weather step is expanded into one
        // sub-step per waypoint once `route` completes. The Coordinator
        // performs the expansion lazily (see coordinator::expand_fan_out);
        // the Router only records which step is the fan-out template.
        if capabilities.contains(&CapabilityClass::Route) {
            if let Some(weather_step) = steps.iter_mut().find(|s| s.capability == CapabilityClass::Weather) {
                weather_step.fan_out_of = Some(StepId::new_unchecked("route"));
            }
        }

        let deadline: Duration = steps.iter().map(|s| s.timeout).sum::<Duration>().mul_f64(1.5);

        ExecutionPlan {
            plan_id: PlanId::generate(),
            request_id: request.request_id.clone(),
            user_id: None,
            steps,
            created_at: chrono::Utc::now(),
            deadline,
            slot_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentDescriptor, Capability, GeoPoint, PassagePreferences, VesselProfile};
    use orchestrator_core::RequestId;
    use std::sync::Arc;

    fn sample_request() -> PassageRequest {
        PassageRequest {
            request_id: RequestId::generate(),
            departure: GeoPoint { lat: 42.3601, lon: -71.0589 },
            destination: GeoPoint { lat: 43.6591, lon: -70.2568 },
            waypoints: vec![],
            vessel: VesselProfile { kind: "cruise".into(), cruise_speed_kn: 5.0 },
            preferences: PassagePreferences::default(),
            departure_time: chrono::Utc::now(),
            prompt: None,
        }
    }

    fn registry_with_all_agents() -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new());
        for (id, op) in [
            ("ports-1", "get_port_info"),
            ("route-1", "calculate_route"),
            ("weather-1", "get_marine_forecast"),
            ("wind-1", "analyze_wind"),
            ("tides-1", "get_tide_predictions"),
            ("safety-1", "check_safety"),
        ] {
            registry.register(AgentDescriptor {
                agent_id: AgentId::parse(id).unwrap(),
                display_name: id.into(),
                version: "1.0".into(),
                base_endpoint: format!("http://{id}"),
                capabilities: vec![Capability::new(op)],
                health_endpoint: format!("http://{id}/health"),
            });
            registry.update_status(&AgentId::parse(id).unwrap(), crate::types::AgentStatus::Active, None);
        }
        registry
    }

    #[test]
    fn default_request_produces_full_dag() {
        let registry = registry_with_all_agents();
        let router = RequestRouter::new(registry, RouterConfig::default());
        let plan = router.route(sample_request());

        assert!(plan.is_acyclic());
        assert_eq!(plan.steps.len(), 6);

        let route_step = plan.step(&StepId::new_unchecked("route")).unwrap();
        assert_eq!(route_step.depends_on, vec![StepId::new_unchecked("ports")]);

        let weather_step = plan.step(&StepId::new_unchecked("weather")).unwrap();
        assert_eq!(weather_step.depends_on, vec![StepId::new_unchecked("route")]);
        assert_eq!(weather_step.fan_out_of, Some(StepId::new_unchecked("route")));
    }

    #[test]
    fn narrow_prompt_produces_reduced_set() {
        let registry = registry_with_all_agents();
        let router = RequestRouter::new(registry, RouterConfig::default());
        let mut request = sample_request();
        request.prompt = Some("weather only please".to_string());
        let plan = router.route(request);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].capability, CapabilityClass::Weather);
        assert_eq!(plan.steps[0].fan_out_of, None, "weather-only plan has no route step to fan out of");
    }

    #[test]
    fn determinism_same_request_same_registry_same_plan() {
        let registry = registry_with_all_agents();
        let router = RequestRouter::new(registry, RouterConfig::default());
        let request = sample_request();
        let plan_a = router.route(request.clone());
        let plan_b = router.route(request);

        let mut steps_a: Vec<_> = plan_a.steps.iter().map(|s| (s.id.clone(), s.selector.clone(), s.depends_on.clone())).collect();
        let mut steps_b: Vec<_> = plan_b.steps.iter().map(|s| (s.id.clone(), s.selector.clone(), s.depends_on.clone())).collect();
        steps_a.sort_by(|a, b| a.0.cmp(&b.0));
        steps_b.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(steps_a, steps_b);
    }

    #[test]
    fn deadline_is_sum_of_timeouts_times_1_5() {
        let registry = registry_with_all_agents();
        let router = RequestRouter::new(registry, RouterConfig::default());
        let plan = router.route(sample_request());
        let sum: Duration = plan.steps.iter().map(|s| s.timeout).sum();
        assert_eq!(plan.deadline, sum.mul_f64(1.5));
    }
}
