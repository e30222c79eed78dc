//! Plan lifecycle events, modeled as values written to a bounded per-plan
//! channel rather than dispatched to listeners, so back-pressure is explicit.

use orchestrator_core::{AgentId, PlanId, StepId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the per-plan event channel. A slow subscriber drops the
/// oldest events rather than stalling the Coordinator.
pub const PLAN_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanStarted {
        plan_id: PlanId,
    },
    StepStarted {
        plan_id: PlanId,
        step_id: StepId,
    },
    StepCompleted {
        plan_id: PlanId,
        step_id: StepId,
        latency: Duration,
        fallback: bool,
    },
    StepFailed {
        plan_id: PlanId,
        step_id: StepId,
        message: String,
    },
    PlanCompleted {
        plan_id: PlanId,
    },
    PlanFailed {
        plan_id: PlanId,
        error: String,
    },
    PlanCancelled {
        plan_id: PlanId,
    },
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentUpdated {
        agent_id: AgentId,
    },
    AgentHealthy {
        agent_id: AgentId,
    },
    AgentUnhealthy {
        agent_id: AgentId,
    },
    RequestQueued {
        plan_id: PlanId,
        step_id: StepId,
        queue_id: String,
    },
}

/// A bounded broadcast channel dedicated to one plan's events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlanEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PLAN_EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Ignored if no subscribers are currently listening;
    /// events are not durable and the core writes nothing to disk.
    pub fn emit(&self, event: PlanEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(PlanEvent::PlanStarted {
            plan_id: PlanId::generate(),
        });
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PlanEvent::PlanStarted { .. }));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(PlanEvent::PlanCompleted {
            plan_id: PlanId::generate(),
        });
    }
}
