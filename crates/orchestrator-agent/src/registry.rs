//! Agent Registry: the authoritative mapping agent id -> (descriptor, state).

use crate::events::{EventBus, PlanEvent};
use crate::types::{AgentDescriptor, AgentRuntimeState, AgentStatus};
use orchestrator_core::AgentId;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

/// Thread-safe registry. Readers (Router, Coordinator) are frequent; writers
/// are Discovery and the Health Monitor. Updates to different agent ids are
/// independent of each other.
pub struct AgentRegistry {
    entries: RwLock<HashMap<AgentId, (AgentDescriptor, AgentRuntimeState)>>,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Upsert by agent id. Resets runtime state to defaults when the
    /// descriptor's version changes (a new deployment starts with a clean
    /// slate of metrics).
    pub fn register(&self, descriptor: AgentDescriptor) {
        let mut entries = self.entries.write().unwrap();
        let agent_id = descriptor.agent_id.clone();
        let version_changed = entries
            .get(&agent_id)
            .map(|(existing, _)| existing.version != descriptor.version)
            .unwrap_or(true);

        if version_changed {
            entries.insert(agent_id.clone(), (descriptor, AgentRuntimeState::default()));
        } else {
            let state = entries.get(&agent_id).map(|(_, s)| s.clone()).unwrap();
            entries.insert(agent_id.clone(), (descriptor, state));
        }
        drop(entries);
        tracing::info!(agent = %agent_id, version_changed, "agent registered");
        self.events.emit(PlanEvent::AgentRegistered { agent_id });
    }

    pub fn lookup(&self, agent_id: &AgentId) -> Option<AgentDescriptor> {
        self.entries
            .read()
            .unwrap()
            .get(agent_id)
            .map(|(d, _)| d.clone())
    }

    pub fn runtime_state(&self, agent_id: &AgentId) -> Option<AgentRuntimeState> {
        self.entries
            .read()
            .unwrap()
            .get(agent_id)
            .map(|(_, s)| s.clone())
    }

    /// Agents whose status is selectable and which declare the operation,
    /// ordered by success rate desc, average latency asc, then agent id asc
    /// to make ties deterministic.
    pub fn select_by_capability(&self, operation: &str) -> Vec<AgentId> {
        let entries = self.entries.read().unwrap();
        let mut candidates: Vec<(AgentId, f64, f64)> = entries
            .iter()
            .filter(|(_, (descriptor, state))| {
                state.status.is_selectable() && descriptor.supports(operation)
            })
            .map(|(id, (_, state))| (id.clone(), state.metrics.success_rate, state.metrics.avg_latency_ms))
            .collect();

        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap()
                .then_with(|| a.2.partial_cmp(&b.2).unwrap())
                .then_with(|| a.0.cmp(&b.0))
        });

        candidates.into_iter().map(|(id, ..)| id).collect()
    }

    /// Idempotent: setting the same status twice has no additional effect
    /// beyond updating `last_error`.
    pub fn update_status(&self, agent_id: &AgentId, status: AgentStatus, reason: Option<String>) {
        let mut entries = self.entries.write().unwrap();
        if let Some((_, state)) = entries.get_mut(agent_id) {
            state.status = status;
            if let Some(reason) = reason {
                state.last_error = Some(reason);
            }
        }
    }

    /// Record a Health Monitor probe outcome. Owns the consecutive-failure
    /// counter and the resulting status transition: a single failure sets
    /// `degraded`; three-in-a-row sets `error`; a success resets the streak
    /// and sets `active`. Returns the new status.
    pub fn record_health_probe(&self, agent_id: &AgentId, success: bool) -> Option<AgentStatus> {
        let mut entries = self.entries.write().unwrap();
        let (_, state) = entries.get_mut(agent_id)?;

        if success {
            state.consecutive_health_failures = 0;
            state.status = AgentStatus::Active;
            state.last_heartbeat = Some(chrono::Utc::now());
            tracing::debug!(agent = %agent_id, "health probe succeeded");
        } else {
            state.consecutive_health_failures += 1;
            state.status = if state.consecutive_health_failures >= 3 {
                warn!(agent = %agent_id, "three consecutive health probe failures, marking error");
                AgentStatus::Error
            } else {
                AgentStatus::Degraded
            };
            state.last_error = Some("health probe failed".to_string());
        }
        Some(state.status)
    }

    pub fn record_outcome(&self, agent_id: &AgentId, latency: Duration, ok: bool, error: Option<String>) {
        let mut entries = self.entries.write().unwrap();
        if let Some((_, state)) = entries.get_mut(agent_id) {
            state.metrics.record(latency, ok);
            state.last_heartbeat = Some(chrono::Utc::now());
            if !ok {
                state.last_error = error;
            }
        }
    }

    pub fn all_agent_ids(&self) -> Vec<AgentId> {
        self.entries.read().unwrap().keys().cloned().collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
