//! Response Aggregator: merges all terminal `StepResult`s for a plan into a
//! single `AggregatedPlan`. Slot membership comes from `ExecutionPlan::slot_map`,
//! never inferred from step names, so a Router change cannot silently break
//! aggregation.

use crate::types::{AggregatedPlan, ExecutionPlan, PassageRequest, StepResult};
use orchestrator_core::StepId;
use std::collections::HashMap;

const WIND_LIGHT_KN: f64 = 5.0;
const WIND_STRONG_KN: f64 = 20.0;
const WAVE_ROUGH_FT: f64 = 3.0;
const LONG_PASSAGE_NM: f64 = 200.0;
const LONG_DURATION_HOURS: f64 = 24.0;

pub struct ResponseAggregator;

impl ResponseAggregator {
    pub fn aggregate(plan: &ExecutionPlan, results: &HashMap<StepId, StepResult>, request: PassageRequest) -> AggregatedPlan {
        let mut warnings = Vec::new();

        let slot_value = |slot: &str, warnings: &mut Vec<String>| -> Option<serde_json::Value> {
            let step_id = plan.slot_map.get(slot)?;
            match results.get(step_id) {
                Some(StepResult::Ok { payload, degraded, .. }) => {
                    if *degraded {
                        warnings.push(format!("{slot} result is degraded"));
                    }
                    Some(payload.clone())
                }
                Some(StepResult::Error { message, .. }) => {
                    warnings.push(format!("{slot} step failed: {message}"));
                    None
                }
                Some(StepResult::Skipped { reason }) => {
                    warnings.push(format!("{slot} step skipped: {reason}"));
                    None
                }
                None => None,
            }
        };

        let route = slot_value("route", &mut warnings);
        let tides = slot_value("tides", &mut warnings);
        let wind = slot_value("wind", &mut warnings);
        let safety = slot_value("safety", &mut warnings);
        let ports = slot_value("ports", &mut warnings);
        let weather = Self::merge_weather(plan, results, &mut warnings, &slot_value);

        let total_distance_nm = route.as_ref().and_then(|r| r.get("distance_nm")).and_then(|v| v.as_f64());
        let estimated_duration_hours = route.as_ref().and_then(|r| r.get("duration_hours")).and_then(|v| v.as_f64());
        let estimated_arrival = estimated_duration_hours
            .map(|h| request.departure_time + chrono::Duration::minutes((h * 60.0).round() as i64));

        let max_wind_kn = wind.as_ref().and_then(|w| w.get("wind_kn")).and_then(|v| v.as_f64());
        let max_wave_ft = Self::max_wave_height(&safety, &weather);

        if let Some(kn) = max_wind_kn {
            if kn > WIND_STRONG_KN {
                warnings.push("strong wind conditions expected".to_string());
            }
        }
        if let Some(ft) = max_wave_ft {
            if ft > WAVE_ROUGH_FT {
                warnings.push("rough sea conditions expected".to_string());
            }
        }

        let recommendations = Self::recommendations(max_wind_kn, max_wave_ft, total_distance_nm, estimated_duration_hours);

        let success = route.is_some();
        let error = if success { None } else { Some("route step produced no usable output".to_string()) };

        AggregatedPlan {
            plan_id: plan.plan_id.clone(),
            request,
            route,
            weather,
            tides,
            wind,
            safety,
            ports,
            total_distance_nm,
            estimated_duration_hours,
            estimated_arrival,
            warnings,
            recommendations,
            success,
            error,
        }
    }

    /// Collect one weather entry per waypoint, ordered by waypoint index. If
    /// the `weather` step was never fanned out (e.g. `route` failed before
    /// expansion), falls back to whatever the template slot itself resolved to.
    fn merge_weather(
        plan: &ExecutionPlan,
        results: &HashMap<StepId, StepResult>,
        warnings: &mut Vec<String>,
        slot_value: &impl Fn(&str, &mut Vec<String>) -> Option<serde_json::Value>,
    ) -> Vec<serde_json::Value> {
        let Some(template_id) = plan.slot_map.get("weather") else {
            return Vec::new();
        };

        let mut entries: Vec<(usize, serde_json::Value)> = Vec::new();
        for step in &plan.steps {
            if step.fan_out_of.as_ref() != Some(template_id) {
                continue;
            }
            match results.get(&step.id) {
                Some(StepResult::Ok { payload, degraded, .. }) => {
                    if *degraded {
                        warnings.push(format!("weather result is degraded for waypoint {}", step.waypoint_index.unwrap_or(0)));
                    }
                    entries.push((step.waypoint_index.unwrap_or(0), payload.clone()));
                }
                Some(StepResult::Error { message, .. }) => {
                    warnings.push(format!(
                        "weather step failed for waypoint {}: {message}",
                        step.waypoint_index.unwrap_or(0)
                    ));
                }
                Some(StepResult::Skipped { reason }) => {
                    warnings.push(format!("weather step skipped for waypoint {}: {reason}", step.waypoint_index.unwrap_or(0)));
                }
                None => {}
            }
        }

        if entries.is_empty() {
            if let Some(direct) = slot_value("weather", warnings) {
                entries.push((0, direct));
            }
        }

        entries.sort_by_key(|(idx, _)| *idx);
        entries.into_iter().map(|(_, v)| v).collect()
    }

    fn max_wave_height(safety: &Option<serde_json::Value>, weather: &[serde_json::Value]) -> Option<f64> {
        let from_safety = safety.as_ref().and_then(|s| s.get("wave_ft")).and_then(|v| v.as_f64());
        let from_weather = weather
            .iter()
            .filter_map(|w| w.get("wave_ft").and_then(|v| v.as_f64()))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        match (from_safety, from_weather) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    fn recommendations(
        max_wind_kn: Option<f64>,
        max_wave_ft: Option<f64>,
        total_distance_nm: Option<f64>,
        estimated_duration_hours: Option<f64>,
    ) -> Vec<String> {
        let mut recs = Vec::new();
        if let Some(kn) = max_wind_kn {
            if kn < WIND_LIGHT_KN {
                recs.push("consider motor sailing".to_string());
            }
            if kn > WIND_STRONG_KN {
                recs.push("reef early".to_string());
            }
        }
        if let Some(ft) = max_wave_ft {
            if ft > WAVE_ROUGH_FT {
                recs.push("rough sea warning".to_string());
            }
        }
        if let Some(nm) = total_distance_nm {
            if nm > LONG_PASSAGE_NM {
                recs.push("provision for long passage".to_string());
            }
        }
        if let Some(h) = estimated_duration_hours {
            if h > LONG_DURATION_HOURS {
                recs.push("organize watch schedule".to_string());
            }
        }
        recs.push("file a float plan".to_string());
        recs.push("verify safety equipment".to_string());
        recs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentSelector, CapabilityClass, GeoPoint, InputTemplate, PassagePreferences, Step, VesselProfile};
    use orchestrator_core::{AgentId, PlanId, RequestId};
    use std::time::Duration;

    fn step(id: &str, capability: CapabilityClass, fan_out_of: Option<&str>, waypoint_index: Option<usize>) -> Step {
        Step {
            id: StepId::new_unchecked(id),
            capability,
            operation: capability.operation_name().to_string(),
            selector: AgentSelector::AnyCapable,
            fallback_agent: None,
            depends_on: vec![],
            input: InputTemplate::default(),
            timeout: Duration::from_secs(10),
            retry_budget: 2,
            fan_out_of: fan_out_of.map(StepId::new_unchecked),
            waypoint_index,
        }
    }

    fn request() -> PassageRequest {
        PassageRequest {
            request_id: RequestId::generate(),
            departure: GeoPoint { lat: 42.36, lon: -71.06 },
            destination: GeoPoint { lat: 43.66, lon: -70.26 },
            waypoints: vec![],
            vessel: VesselProfile { kind: "cruise".into(), cruise_speed_kn: 5.0 },
            preferences: PassagePreferences::default(),
            departure_time: "2026-07-27T08:00:00Z".parse().unwrap(),
            prompt: None,
        }
    }

    fn ok(payload: serde_json::Value) -> StepResult {
        StepResult::Ok {
            payload,
            latency: Duration::from_millis(50),
            source_agent_id: AgentId::new_unchecked("agent-1"),
            fallback: false,
            strategy: None,
            degraded: false,
        }
    }

    #[test]
    fn happy_path_merges_weather_and_computes_summary() {
        let route_step = step("route", CapabilityClass::Route, None, None);
        let weather_template = step("weather", CapabilityClass::Weather, None, None);
        let wp0 = step("weather_wp_0", CapabilityClass::Weather, Some("weather"), Some(0));
        let wp1 = step("weather_wp_1", CapabilityClass::Weather, Some("weather"), Some(1));

        let mut slot_map = HashMap::new();
        slot_map.insert("route".to_string(), route_step.id.clone());
        slot_map.insert("weather".to_string(), weather_template.id.clone());

        let plan = ExecutionPlan {
            plan_id: PlanId::generate(),
            request_id: RequestId::generate(),
            user_id: None,
            steps: vec![route_step.clone(), weather_template, wp0.clone(), wp1.clone()],
            created_at: chrono::Utc::now(),
            deadline: Duration::from_secs(60),
            slot_map,
        };

        let mut results = HashMap::new();
        results.insert(route_step.id.clone(), ok(serde_json::json!({"distance_nm": 250.0, "duration_hours": 30.0})));
        results.insert(wp1.id.clone(), ok(serde_json::json!({"wind_kn": 25.0, "wave_ft": 4.0})));
        results.insert(wp0.id.clone(), ok(serde_json::json!({"wind_kn": 10.0, "wave_ft": 1.0})));

        let aggregated = ResponseAggregator::aggregate(&plan, &results, request());
        assert!(aggregated.success);
        assert_eq!(aggregated.weather.len(), 2);
        assert_eq!(aggregated.weather[0]["wind_kn"], 10.0);
        assert_eq!(aggregated.weather[1]["wind_kn"], 25.0);
        assert_eq!(aggregated.total_distance_nm, Some(250.0));
        assert!(aggregated.recommendations.contains(&"provision for long passage".to_string()));
        assert!(aggregated.recommendations.contains(&"organize watch schedule".to_string()));
        assert!(aggregated.recommendations.contains(&"file a float plan".to_string()));
        assert!(aggregated.recommendations.contains(&"verify safety equipment".to_string()));
    }

    #[test]
    fn failed_route_yields_success_false_with_error() {
        let route_step = step("route", CapabilityClass::Route, None, None);
        let mut slot_map = HashMap::new();
        slot_map.insert("route".to_string(), route_step.id.clone());

        let plan = ExecutionPlan {
            plan_id: PlanId::generate(),
            request_id: RequestId::generate(),
            user_id: None,
            steps: vec![route_step.clone()],
            created_at: chrono::Utc::now(),
            deadline: Duration::from_secs(60),
            slot_map,
        };

        let mut results = HashMap::new();
        results.insert(
            route_step.id.clone(),
            StepResult::Error {
                kind: orchestrator_core::ErrorKind::Unreachable,
                message: "no route agent reachable".to_string(),
                retryable: true,
                source_agent_id: None,
            },
        );

        let aggregated = ResponseAggregator::aggregate(&plan, &results, request());
        assert!(!aggregated.success);
        assert!(aggregated.error.is_some());
        assert!(aggregated.warnings.iter().any(|w| w.contains("route step failed")));
    }

    #[test]
    fn degraded_slot_surfaces_as_warning() {
        let ports_step = step("ports", CapabilityClass::Ports, None, None);
        let mut slot_map = HashMap::new();
        slot_map.insert("ports".to_string(), ports_step.id.clone());

        let plan = ExecutionPlan {
            plan_id: PlanId::generate(),
            request_id: RequestId::generate(),
            user_id: None,
            steps: vec![ports_step.clone()],
            created_at: chrono::Utc::now(),
            deadline: Duration::from_secs(60),
            slot_map,
        };

        let mut results = HashMap::new();
        results.insert(
            ports_step.id.clone(),
            StepResult::Ok {
                payload: serde_json::json!({"degraded": true}),
                latency: Duration::from_millis(0),
                source_agent_id: AgentId::new_unchecked("agent-1"),
                fallback: true,
                strategy: Some("degraded".to_string()),
                degraded: true,
            },
        );

        let aggregated = ResponseAggregator::aggregate(&plan, &results, request());
        assert!(aggregated.warnings.iter().any(|w| w.contains("ports result is degraded")));
    }
}
