//! In-process event bus.
//!
//! Observers (dashboards, tests) subscribe to a broadcast channel. Publishing
//! never blocks; an observer that falls behind loses the oldest events and
//! sees a `Lagged` error on its next receive.

use tokio::sync::broadcast;

use crate::types::{AgentError, AgentState, HealthRecord, MetricsSnapshot};

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A failure was classified.
    Error {
        agent: String,
        error: AgentError,
        context: String,
    },
    Health(HealthRecord),
    Metrics(MetricsSnapshot),
    /// A dead-lettered operation is being replayed.
    Replay {
        agent: String,
        operation: String,
        payload: serde_json::Value,
    },
    StateChanged {
        agent: String,
        from: AgentState,
        to: AgentState,
    },
}

impl AgentEvent {
    pub fn agent(&self) -> &str {
        match self {
            AgentEvent::Error { agent, .. }
            | AgentEvent::Replay { agent, .. }
            | AgentEvent::StateChanged { agent, .. } => agent,
            AgentEvent::Health(h) => &h.agent,
            AgentEvent::Metrics(m) => &m.agent,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. Dropped silently when nobody listens.
    pub fn publish(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
