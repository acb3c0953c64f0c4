use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{EndpointId, Phase, ProbeState, RunState, RunSummary, ThroughputState};

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub type EventSender = broadcast::Sender<EngineEvent>;
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProbeUpdate {
    pub id: EndpointId,
    pub state: ProbeState,
}

/// Everything a host needs to render engine activity.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run: RunState,
    },
    /// A start request was refused because another run is active.
    RunRejected {
        requested: Phase,
        active_run_id: u64,
    },
    /// Phase results of the listed endpoints were reset at run start.
    PhaseReset {
        run_id: u64,
        phase: Phase,
        ids: Vec<EndpointId>,
    },
    /// One settled latency batch, coalesced into a single update.
    ProbeBatch {
        run_id: u64,
        batch: u64,
        updates: Vec<ProbeUpdate>,
        completed: u64,
        total: u64,
        progress: f64,
    },
    /// Endpoints forced to FAILED because they were not ONLINE.
    ThroughputExcluded {
        run_id: u64,
        ids: Vec<EndpointId>,
    },
    ThroughputProgress {
        run_id: u64,
        id: EndpointId,
        state: ThroughputState,
    },
    ThroughputBatch {
        run_id: u64,
        batch: u64,
        completed: u64,
        total: u64,
        progress: f64,
    },
    CancelRequested {
        run_id: u64,
    },
    RunFinished {
        summary: RunSummary,
    },
    EndpointsAdded {
        origin: String,
        added: usize,
        skipped_duplicates: usize,
        skipped_by_filter: usize,
        skipped_invalid: usize,
    },
    EndpointsCleared {
        removed: usize,
    },
    IngestFailed {
        origin: String,
        message: String,
    },
}

pub fn channel() -> (EventSender, EventReceiver) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

/// Best-effort publish: having no subscribers is not an error.
pub fn publish(tx: &EventSender, event: EngineEvent) {
    let _ = tx.send(event);
}
