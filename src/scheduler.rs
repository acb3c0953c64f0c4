//! Batch scheduler for both probing phases.
//!
//! Endpoints are cut into consecutive batches in input order. Every probe of a
//! batch runs concurrently on the calling task and the batch is joined before
//! the next one starts, so at most one batch worth of probes is ever in flight.
//! The cancellation token is checked before each batch, before each probe and
//! again before any result is written. Once cancelled, nothing further from
//! the run reaches the store or the event channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use std::panic::AssertUnwindSafe;

use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{self, EngineEvent, EventSender, ProbeUpdate};
use crate::probe::{
    LatencyProbe, ProbeError, ProgressReporter, ThroughputOutcome, ThroughputProbe,
};
use crate::store::{self, SharedStore};
use crate::types::{
    progress_percent, Endpoint, EndpointId, Phase, ProbeState, ProbeStatus, RunOutcome,
    RunSummary, ThroughputState, ThroughputStatus, ThroughputUpdate,
};

/// Completed/total counters of a run, readable while it is in progress.
#[derive(Clone, Debug, Default)]
pub struct RunProgress {
    pub completed: Arc<AtomicU64>,
    pub total: Arc<AtomicU64>,
}

impl RunProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn percent(&self) -> f64 {
        progress_percent(self.completed(), self.total())
    }
}

/// Handles one run needs to publish its results.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: u64,
    pub store: SharedStore,
    pub events: EventSender,
    pub cancel: CancellationToken,
    pub progress: RunProgress,
}

impl RunContext {
    pub fn new(run_id: u64, store: SharedStore, events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            store,
            events,
            cancel,
            progress: RunProgress::new(),
        }
    }

    /// Write latency results unless the run was cancelled. The cancellation
    /// check happens under the store lock so a newer run's reset can not be
    /// overwritten by this one.
    fn commit_probe_results(&self, updates: &[ProbeUpdate]) -> bool {
        let mut guard = store::lock(&self.store);
        if self.cancel.is_cancelled() {
            return false;
        }
        guard.apply_probe_results(updates.iter().map(|u| (u.id, u.state)));
        true
    }

    /// Put the listed endpoints back to PENDING with idle throughput, unless
    /// the run was cancelled.
    fn commit_latency_reset(&self, ids: &[EndpointId]) -> bool {
        let mut guard = store::lock(&self.store);
        if self.cancel.is_cancelled() {
            return false;
        }
        guard.reset_phase_results(ids.iter().copied());
        true
    }

    fn commit_throughput(&self, id: EndpointId, update: ThroughputUpdate) -> bool {
        let state = {
            let mut guard = store::lock(&self.store);
            if self.cancel.is_cancelled() {
                return false;
            }
            guard.apply_throughput_update(&id, update)
        };
        if let Some(state) = state {
            events::publish(
                &self.events,
                EngineEvent::ThroughputProgress {
                    run_id: self.run_id,
                    id,
                    state,
                },
            );
        }
        true
    }

    fn summary(&self, phase: Phase, batches: u64, started: Instant) -> RunSummary {
        let outcome = if self.cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };
        RunSummary {
            run_id: self.run_id,
            phase,
            outcome,
            total_count: self.progress.total(),
            completed_count: self.progress.completed(),
            batches,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Batch size of the throughput phase: half the limit, at least one.
pub fn throughput_batch_size(concurrency_limit: usize) -> usize {
    (concurrency_limit / 2).max(1)
}

/// Run the latency phase over `endpoints` in batches of `concurrency_limit`.
///
/// Every endpoint is reset to PENDING first. Each settled batch is published
/// as one [`EngineEvent::ProbeBatch`]. A probe error marks only that endpoint
/// as ERROR.
pub async fn run_latency_phase(
    endpoints: &[Endpoint],
    concurrency_limit: usize,
    probe: &dyn LatencyProbe,
    ctx: &RunContext,
) -> RunSummary {
    let started = Instant::now();
    let limit = concurrency_limit.max(1);
    let total = endpoints.len() as u64;
    ctx.progress.total.store(total, Ordering::Relaxed);

    let ids: Vec<EndpointId> = endpoints.iter().map(|e| e.id).collect();
    if !ctx.commit_latency_reset(&ids) {
        return ctx.summary(Phase::Latency, 0, started);
    }
    events::publish(
        &ctx.events,
        EngineEvent::PhaseReset {
            run_id: ctx.run_id,
            phase: Phase::Latency,
            ids,
        },
    );
    info!(run_id = ctx.run_id, total, limit, "latency phase started");

    let mut batches = 0u64;
    for (batch_no, batch) in endpoints.chunks(limit).enumerate() {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let batch_no = batch_no as u64 + 1;
        debug!(run_id = ctx.run_id, batch = batch_no, size = batch.len(), "issuing latency batch");

        let settled = join_all(batch.iter().map(|ep| probe_latency(probe, ep, &ctx.cancel))).await;
        let updates: Vec<ProbeUpdate> = settled.into_iter().flatten().collect();

        if !ctx.commit_probe_results(&updates) {
            debug!(run_id = ctx.run_id, batch = batch_no, "run cancelled, batch discarded");
            break;
        }
        batches = batch_no;
        let completed = ctx
            .progress
            .completed
            .fetch_add(batch.len() as u64, Ordering::Relaxed)
            + batch.len() as u64;
        let progress = progress_percent(completed, total);
        events::publish(
            &ctx.events,
            EngineEvent::ProbeBatch {
                run_id: ctx.run_id,
                batch: batch_no,
                updates,
                completed,
                total,
                progress,
            },
        );
        info!(run_id = ctx.run_id, batch = batch_no, completed, total, "latency batch settled");
    }

    ctx.summary(Phase::Latency, batches, started)
}

async fn probe_latency(
    probe: &dyn LatencyProbe,
    endpoint: &Endpoint,
    cancel: &CancellationToken,
) -> Option<ProbeUpdate> {
    if cancel.is_cancelled() {
        return None;
    }
    let settled = AssertUnwindSafe(probe.probe(endpoint, cancel)).catch_unwind().await;
    let state = match settled {
        Ok(Ok(state)) if state.status() == ProbeStatus::Pending => {
            warn!(endpoint = %endpoint.address, port = endpoint.port, "probe returned PENDING, recording ERROR");
            ProbeState::error()
        }
        Ok(Ok(state)) => state,
        Ok(Err(ProbeError::Cancelled)) if cancel.is_cancelled() => return None,
        Ok(Err(e)) => {
            warn!(endpoint = %endpoint.address, port = endpoint.port, error = %e, "latency probe failed");
            ProbeState::error()
        }
        Err(_) => {
            warn!(endpoint = %endpoint.address, port = endpoint.port, "latency probe panicked, recording ERROR");
            ProbeState::error()
        }
    };
    Some(ProbeUpdate {
        id: endpoint.id,
        state,
    })
}

/// Run the throughput phase.
///
/// Endpoints that are not ONLINE in the store are marked FAILED up front and
/// never scheduled. The rest run in batches of
/// [`throughput_batch_size`]`(concurrency_limit)`; each member moves to
/// TESTING before its probe starts and every progress report is forwarded as
/// its own [`EngineEvent::ThroughputProgress`].
pub async fn run_throughput_phase(
    endpoints: &[Endpoint],
    concurrency_limit: usize,
    target_size_mb: f64,
    probe: &dyn ThroughputProbe,
    ctx: &RunContext,
) -> RunSummary {
    let started = Instant::now();
    let batch_size = throughput_batch_size(concurrency_limit);
    let target_size_mb = if target_size_mb > 0.0 {
        target_size_mb
    } else {
        ThroughputState::DEFAULT_TARGET_SIZE_MB
    };

    let (eligible, excluded) = {
        let mut guard = store::lock(&ctx.store);
        if ctx.cancel.is_cancelled() {
            return ctx.summary(Phase::Throughput, 0, started);
        }
        let (eligible, excluded): (Vec<&Endpoint>, Vec<&Endpoint>) = endpoints
            .iter()
            .partition(|e| guard.get(&e.id).is_some_and(|r| r.probe.is_online()));
        for e in &excluded {
            guard.apply_throughput_update(&e.id, ThroughputUpdate::status(ThroughputStatus::Failed));
        }
        for e in &eligible {
            guard.apply_throughput_update(
                &e.id,
                ThroughputUpdate {
                    status: Some(ThroughputStatus::Idle),
                    progress: Some(0.0),
                    download_speed_mbps: Some(0.0),
                    target_size_mb: Some(target_size_mb),
                },
            );
        }
        (eligible, excluded)
    };

    let total = eligible.len() as u64;
    ctx.progress.total.store(total, Ordering::Relaxed);
    events::publish(
        &ctx.events,
        EngineEvent::ThroughputExcluded {
            run_id: ctx.run_id,
            ids: excluded.iter().map(|e| e.id).collect(),
        },
    );
    events::publish(
        &ctx.events,
        EngineEvent::PhaseReset {
            run_id: ctx.run_id,
            phase: Phase::Throughput,
            ids: eligible.iter().map(|e| e.id).collect(),
        },
    );
    info!(
        run_id = ctx.run_id,
        eligible = total,
        excluded = excluded.len(),
        batch_size,
        "throughput phase started"
    );

    let mut batches = 0u64;
    for (batch_no, batch) in eligible.chunks(batch_size).enumerate() {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let batch_no = batch_no as u64 + 1;
        debug!(run_id = ctx.run_id, batch = batch_no, size = batch.len(), "issuing throughput batch");

        join_all(
            batch
                .iter()
                .map(|ep| probe_throughput(probe, ep, target_size_mb, ctx)),
        )
        .await;

        if ctx.cancel.is_cancelled() {
            break;
        }
        batches = batch_no;
        let completed = ctx
            .progress
            .completed
            .fetch_add(batch.len() as u64, Ordering::Relaxed)
            + batch.len() as u64;
        events::publish(
            &ctx.events,
            EngineEvent::ThroughputBatch {
                run_id: ctx.run_id,
                batch: batch_no,
                completed,
                total,
                progress: progress_percent(completed, total),
            },
        );
        info!(run_id = ctx.run_id, batch = batch_no, completed, total, "throughput batch settled");
    }

    ctx.summary(Phase::Throughput, batches, started)
}

async fn probe_throughput(
    probe: &dyn ThroughputProbe,
    endpoint: &Endpoint,
    target_size_mb: f64,
    ctx: &RunContext,
) {
    let id = endpoint.id;
    if ctx.cancel.is_cancelled()
        || !ctx.commit_throughput(id, ThroughputUpdate::status(ThroughputStatus::Testing))
    {
        return;
    }

    let forward = |progress: f64, speed: f64| {
        ctx.commit_throughput(id, ThroughputUpdate::progress(progress, speed));
    };
    let reporter = ProgressReporter::new(&ctx.cancel, &forward);

    let settled = AssertUnwindSafe(probe.probe(endpoint, target_size_mb, &reporter))
        .catch_unwind()
        .await;
    let update = match settled {
        Ok(Ok(ThroughputOutcome::Completed { final_speed_mbps })) => ThroughputUpdate {
            status: Some(ThroughputStatus::Completed),
            progress: Some(100.0),
            download_speed_mbps: Some(final_speed_mbps),
            target_size_mb: None,
        },
        Ok(Ok(ThroughputOutcome::Failed { last_speed_mbps })) => ThroughputUpdate {
            status: Some(ThroughputStatus::Failed),
            download_speed_mbps: Some(last_speed_mbps),
            ..Default::default()
        },
        Ok(Err(ProbeError::Cancelled)) if ctx.cancel.is_cancelled() => return,
        Ok(Err(e)) => {
            warn!(endpoint = %endpoint.address, port = endpoint.port, error = %e, "throughput probe failed");
            ThroughputUpdate::status(ThroughputStatus::Failed)
        }
        Err(_) => {
            warn!(endpoint = %endpoint.address, port = endpoint.port, "throughput probe panicked, recording FAILED");
            ThroughputUpdate::status(ThroughputStatus::Failed)
        }
    };
    ctx.commit_throughput(id, update);
}
