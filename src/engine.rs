//! Caller-facing probe engine.
//!
//! The engine owns the endpoint collection and at most one active run. Runs
//! execute on a spawned task and report through the event channel; the
//! collection is checked out for the duration of a run and can not be edited
//! until the run ends or is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ::time::{format_description::well_known, OffsetDateTime};

use crate::config::{EngineConfig, ProbeMode};
use crate::events::{self, EngineEvent, EventReceiver, EventSender};
use crate::probe::{HttpThroughputProbe, LatencyProbe, SimulatedProbe, TcpConnectProbe, ThroughputProbe};
use crate::scheduler::{self, RunContext, RunProgress};
use crate::store::{self, EndpointStore, SharedStore, Stats};
use crate::types::{Endpoint, EndpointRecord, Phase, RunState, RunSummary, ThroughputState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("a {0} run is already active")]
    RunActive(Phase),
    #[error("no endpoints loaded")]
    NoEndpoints,
    #[error("concurrency limit must be at least 1")]
    InvalidConcurrency,
}

struct ActiveRun {
    run_id: u64,
    phase: Phase,
    concurrency_limit: usize,
    started_at: String,
    cancel: CancellationToken,
    progress: RunProgress,
}

impl ActiveRun {
    fn state(&self) -> RunState {
        RunState {
            run_id: self.run_id,
            phase: self.phase,
            concurrency_limit: self.concurrency_limit,
            completed_count: self.progress.completed(),
            total_count: self.progress.total(),
            cancellation_requested: self.cancel.is_cancelled(),
            started_at: self.started_at.clone(),
        }
    }
}

/// Handle to a spawned run.
pub struct RunHandle {
    pub run_id: u64,
    handle: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Wait for the run to end. `None` if the run task panicked.
    pub async fn wait(self) -> Option<RunSummary> {
        match self.handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(run_id = self.run_id, error = %e, "run task failed");
                None
            }
        }
    }
}

type RunSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_slot(slot: &RunSlot) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProbeEngine {
    store: SharedStore,
    events: EventSender,
    current_run: RunSlot,
    next_run_id: AtomicU64,
    latency_probe: Arc<dyn LatencyProbe>,
    throughput_probe: Arc<dyn ThroughputProbe>,
    target_size_mb: f64,
}

impl ProbeEngine {
    pub fn new(latency_probe: Arc<dyn LatencyProbe>, throughput_probe: Arc<dyn ThroughputProbe>) -> Self {
        let (events, _) = events::channel();
        Self {
            store: store::shared(EndpointStore::new()),
            events,
            current_run: Arc::new(Mutex::new(None)),
            next_run_id: AtomicU64::new(0),
            latency_probe,
            throughput_probe,
            target_size_mb: ThroughputState::DEFAULT_TARGET_SIZE_MB,
        }
    }

    /// Build an engine with the probes selected by `config.probe_mode`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let engine = match config.probe_mode {
            ProbeMode::Simulated => {
                let sim = Arc::new(SimulatedProbe::new());
                Self::new(sim.clone(), sim)
            }
            ProbeMode::Network => Self::new(
                Arc::new(TcpConnectProbe::new(config.timeout())),
                Arc::new(HttpThroughputProbe::new(
                    config.speed_test_url.clone(),
                    config.download_timeout(),
                )),
            ),
        };
        engine.with_target_size_mb(config.target_size_mb)
    }

    pub fn with_target_size_mb(mut self, target_size_mb: f64) -> Self {
        if target_size_mb > 0.0 {
            self.target_size_mb = target_size_mb;
        }
        self
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        events::publish(&self.events, event);
    }

    pub fn snapshot(&self) -> Vec<EndpointRecord> {
        store::lock(&self.store).records().to_vec()
    }

    pub fn ranked(&self) -> Vec<EndpointRecord> {
        store::lock(&self.store).ranked()
    }

    pub fn top(&self, n: usize) -> Vec<EndpointRecord> {
        store::lock(&self.store).top(n)
    }

    pub fn stats(&self) -> Stats {
        store::lock(&self.store).stats()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        store::lock(&self.store).endpoints()
    }

    pub fn current_run(&self) -> Option<RunState> {
        lock_slot(&self.current_run).as_ref().map(ActiveRun::state)
    }

    pub fn is_running(&self) -> bool {
        lock_slot(&self.current_run).is_some()
    }

    /// Add endpoints whose key is not yet present, ahead of the existing ones.
    pub fn add_endpoints(&self, incoming: &[Endpoint]) -> Result<usize, EngineError> {
        let slot = lock_slot(&self.current_run);
        if let Some(run) = slot.as_ref() {
            return Err(EngineError::RunActive(run.phase));
        }
        let added = store::lock(&self.store).insert_front(incoming);
        Ok(added)
    }

    pub fn clear(&self) -> Result<usize, EngineError> {
        let slot = lock_slot(&self.current_run);
        if let Some(run) = slot.as_ref() {
            return Err(EngineError::RunActive(run.phase));
        }
        let removed = store::lock(&self.store).clear();
        drop(slot);
        info!(removed, "endpoint collection cleared");
        self.publish(EngineEvent::EndpointsCleared { removed });
        Ok(removed)
    }

    pub fn start_latency_run(&self, concurrency_limit: usize) -> Result<RunHandle, EngineError> {
        let (ctx, endpoints) = self.begin_run(Phase::Latency, concurrency_limit)?;
        let run_id = ctx.run_id;
        let probe = self.latency_probe.clone();
        let finisher = self.finisher(run_id);
        let handle = tokio::spawn(async move {
            let summary =
                scheduler::run_latency_phase(&endpoints, concurrency_limit, probe.as_ref(), &ctx).await;
            finisher.finish(&summary);
            summary
        });
        Ok(RunHandle { run_id, handle })
    }

    pub fn start_throughput_run(&self, concurrency_limit: usize) -> Result<RunHandle, EngineError> {
        let (ctx, endpoints) = self.begin_run(Phase::Throughput, concurrency_limit)?;
        let run_id = ctx.run_id;
        let probe = self.throughput_probe.clone();
        let finisher = self.finisher(run_id);
        let target_size_mb = self.target_size_mb;
        let handle = tokio::spawn(async move {
            let summary = scheduler::run_throughput_phase(
                &endpoints,
                concurrency_limit,
                target_size_mb,
                probe.as_ref(),
                &ctx,
            )
            .await;
            finisher.finish(&summary);
            summary
        });
        Ok(RunHandle { run_id, handle })
    }

    /// Request cooperative cancellation of the active run.
    ///
    /// The run counts as ended immediately, so a new run may start right away;
    /// probes already in flight finish on their own but their results are
    /// discarded. Returns `false` when no run was active.
    ///
    /// Throughput tests still in progress are settled as FAILED before this
    /// returns, so no record claims a test is running once the run is over.
    pub fn cancel_active_run(&self) -> bool {
        let mut slot = lock_slot(&self.current_run);
        let Some(run) = slot.take() else {
            debug!("cancel requested with no active run");
            return false;
        };
        run.cancel.cancel();
        let settled = match run.phase {
            Phase::Throughput => store::lock(&self.store).fail_in_progress(),
            Phase::Latency => Vec::new(),
        };
        drop(slot);

        info!(
            run_id = run.run_id,
            phase = %run.phase,
            completed = run.progress.completed(),
            settled = settled.len(),
            "run cancelled"
        );
        self.publish(EngineEvent::CancelRequested { run_id: run.run_id });
        for (id, state) in settled {
            self.publish(EngineEvent::ThroughputProgress {
                run_id: run.run_id,
                id,
                state,
            });
        }
        true
    }

    fn begin_run(&self, phase: Phase, concurrency_limit: usize) -> Result<(RunContext, Vec<Endpoint>), EngineError> {
        if concurrency_limit == 0 {
            return Err(EngineError::InvalidConcurrency);
        }
        let mut slot = lock_slot(&self.current_run);
        if let Some(active) = slot.as_ref() {
            warn!(requested = %phase, active_run_id = active.run_id, "run already active, start ignored");
            self.publish(EngineEvent::RunRejected {
                requested: phase,
                active_run_id: active.run_id,
            });
            return Err(EngineError::RunActive(active.phase));
        }
        let (endpoints, online) = {
            let store = store::lock(&self.store);
            let online = store.records().iter().filter(|r| r.probe.is_online()).count();
            (store.endpoints(), online)
        };
        if endpoints.is_empty() {
            return Err(EngineError::NoEndpoints);
        }
        // Throughput only schedules ONLINE endpoints.
        let total = match phase {
            Phase::Latency => endpoints.len(),
            Phase::Throughput => online,
        };

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = RunContext::new(run_id, self.store.clone(), self.events.clone(), CancellationToken::new());
        ctx.progress.total.store(total as u64, Ordering::Relaxed);
        let run = ActiveRun {
            run_id,
            phase,
            concurrency_limit,
            started_at: now_rfc3339(),
            cancel: ctx.cancel.clone(),
            progress: ctx.progress.clone(),
        };
        let state = run.state();
        *slot = Some(run);
        drop(slot);

        info!(run_id, %phase, total, concurrency_limit, "run started");
        self.publish(EngineEvent::RunStarted { run: state });
        Ok((ctx, endpoints))
    }

    fn finisher(&self, run_id: u64) -> RunFinisher {
        RunFinisher {
            run_id,
            slot: self.current_run.clone(),
            events: self.events.clone(),
            finished: false,
        }
    }
}

/// Releases the run slot when a run's task ends. The slot is also released
/// on drop, so a run task that dies without a summary can not keep it.
struct RunFinisher {
    run_id: u64,
    slot: RunSlot,
    events: EventSender,
    finished: bool,
}

impl RunFinisher {
    fn release(&self) {
        let mut slot = lock_slot(&self.slot);
        if slot.as_ref().is_some_and(|r| r.run_id == self.run_id) {
            *slot = None;
        }
    }

    fn finish(mut self, summary: &RunSummary) {
        self.release();
        self.finished = true;
        info!(
            run_id = summary.run_id,
            phase = %summary.phase,
            outcome = ?summary.outcome,
            completed = summary.completed_count,
            total = summary.total_count,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        events::publish(
            &self.events,
            EngineEvent::RunFinished {
                summary: summary.clone(),
            },
        );
    }
}

impl Drop for RunFinisher {
    fn drop(&mut self) {
        if !self.finished {
            warn!(run_id = self.run_id, "run task ended without a summary, releasing run slot");
        }
        self.release();
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
