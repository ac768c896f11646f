//! Orchestrator-wide event bus.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use drover_core::{InterventionRequest, OutputRecord};

/// Default buffered events per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Summary attached to a finished process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessMetrics {
    pub duration_ms: u64,
    pub total_cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Output records delivered, including the final one.
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Started {
        agent_id: String,
        process_id: String,
        pid: Option<u32>,
    },
    Output {
        agent_id: String,
        process_id: String,
        record: OutputRecord,
    },
    Completed {
        agent_id: String,
        process_id: String,
        exit_code: i32,
        metrics: ProcessMetrics,
    },
    /// A process exited unsuccessfully, or a request never got a process.
    Error {
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        process_id: Option<String>,
        error: String,
    },
    Intervention {
        agent_id: String,
        request: InterventionRequest,
    },
    QueueChanged {
        queued: usize,
        running: usize,
    },
}

impl OrchestratorEvent {
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Started { agent_id, .. }
            | Self::Output { agent_id, .. }
            | Self::Completed { agent_id, .. }
            | Self::Error { agent_id, .. }
            | Self::Intervention { agent_id, .. } => Some(agent_id),
            Self::QueueChanged { .. } => None,
        }
    }

    /// Whether this event ends an agent's run.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// Broadcast fan-out of [`OrchestratorEvent`]s. Emitting never blocks and
/// never fails; events with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscribers");
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
