// ── dere engine: Event Bus ─────────────────────────────────────────────────
// In-process broadcast channel connecting components: workers and
// workflows publish, the ambient FSM and SSE subscribers consume.
// Delivery is best-effort — a lagging subscriber drops old events rather
// than applying backpressure to publishers.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    UserPrompt {
        session_id: i64,
    },
    SessionEnded {
        session_id: i64,
    },
    TaskCompleted {
        task_id: i64,
        task_type: String,
    },
    TaskFailed {
        task_id: i64,
        task_type: String,
        error: String,
    },
    /// The ambient FSM decided to surface something to the user.
    Notification {
        title: String,
        body: String,
        critical: bool,
    },
    NotificationAcknowledged,
    AmbientTransition {
        from: String,
        to: String,
    },
    SwarmStart {
        swarm_id: String,
    },
    SwarmAgentStatus {
        swarm_id: String,
        agent: String,
        status: String,
    },
    SwarmFinished {
        swarm_id: String,
        status: String,
    },
    SwarmSupervisorWarning {
        swarm_id: String,
        elapsed_seconds: i64,
    },
    FindingStored {
        task_id: i64,
        finding_id: i64,
    },
    MissionExecution {
        mission_id: i64,
        execution_id: i64,
        status: String,
    },
    ContextBuilt {
        session_id: i64,
        total_tokens: usize,
    },
}

impl EngineEvent {
    /// Session the event belongs to, for per-session SSE filtering.
    pub fn session_id(&self) -> Option<i64> {
        match self {
            Self::UserPrompt { session_id }
            | Self::SessionEnded { session_id }
            | Self::ContextBuilt { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

const BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. Having zero subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        debug!("[events] {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
