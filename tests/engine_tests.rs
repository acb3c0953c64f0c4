use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use proxy_probe_rs::engine::{EngineError, ProbeEngine};
use proxy_probe_rs::events::EngineEvent;
use proxy_probe_rs::ingest::{self, IngestError};
use proxy_probe_rs::probe::{
    LatencyProbe, ProbeError, ProgressReporter, SimulatedProbe, ThroughputOutcome, ThroughputProbe,
};
use proxy_probe_rs::types::{
    Endpoint, EndpointId, Phase, ProbeState, ProbeStatus, RunOutcome, ThroughputStatus, TransportType,
    TypeFilter,
};

/// Latency probe that tracks how many probes overlap and how often each
/// endpoint was probed.
struct CountingProbe {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<HashMap<EndpointId, usize>>,
    fail_address: Option<&'static str>,
    timeout_address: Option<&'static str>,
    panic_address: Option<&'static str>,
    cancelled_address: Option<&'static str>,
}

impl CountingProbe {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            fail_address: None,
            timeout_address: None,
            panic_address: None,
            cancelled_address: None,
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn calls(&self) -> HashMap<EndpointId, usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LatencyProbe for CountingProbe {
    async fn probe(&self, endpoint: &Endpoint, _cancel: &CancellationToken) -> Result<ProbeState, ProbeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(endpoint.id).or_default() += 1;
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_address == Some(endpoint.address.as_str()) {
            panic!("latency check blew up for {}", endpoint.address);
        }
        if self.fail_address == Some(endpoint.address.as_str()) {
            return Err(ProbeError::Handshake("refused".into()));
        }
        if self.cancelled_address == Some(endpoint.address.as_str()) {
            return Err(ProbeError::Cancelled);
        }
        if self.timeout_address == Some(endpoint.address.as_str()) {
            return Ok(ProbeState::timeout());
        }
        Ok(ProbeState::online(10))
    }
}

/// Throughput probe that records which endpoints it ran for.
#[derive(Default)]
struct RecordingThroughput {
    probed: Mutex<Vec<EndpointId>>,
}

#[async_trait]
impl ThroughputProbe for RecordingThroughput {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        _target_size_mb: f64,
        reporter: &ProgressReporter<'_>,
    ) -> Result<ThroughputOutcome, ProbeError> {
        self.probed.lock().unwrap().push(endpoint.id);
        reporter.report(50.0, 4.0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(ThroughputOutcome::Completed { final_speed_mbps: 5.0 })
    }
}

/// Throughput tester with overlap tracking and per-address failure modes.
/// Every call reports 30% first.
struct InstrumentedThroughput {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<HashMap<EndpointId, usize>>,
    error_address: Option<&'static str>,
    failed_address: Option<&'static str>,
    panic_address: Option<&'static str>,
}

impl InstrumentedThroughput {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            error_address: None,
            failed_address: None,
            panic_address: None,
        }
    }
}

#[async_trait]
impl ThroughputProbe for InstrumentedThroughput {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        _target_size_mb: f64,
        reporter: &ProgressReporter<'_>,
    ) -> Result<ThroughputOutcome, ProbeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(endpoint.id).or_default() += 1;
        reporter.report(30.0, 1.5);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let addr = Some(endpoint.address.as_str());
        if addr == self.panic_address {
            panic!("download blew up");
        }
        if addr == self.error_address {
            return Err(ProbeError::Http("connection reset".into()));
        }
        if addr == self.failed_address {
            return Ok(ThroughputOutcome::Failed { last_speed_mbps: 2.0 });
        }
        Ok(ThroughputOutcome::Completed { final_speed_mbps: 5.0 })
    }
}

/// Engine whose collection is `n` endpoints, all ONLINE after a latency run.
async fn online_engine(n: usize, throughput: Arc<InstrumentedThroughput>) -> ProbeEngine {
    let engine = ProbeEngine::new(Arc::new(CountingProbe::new(1)), throughput);
    engine.add_endpoints(&endpoints(n)).unwrap();
    engine.start_latency_run(n).unwrap().wait().await.unwrap();
    engine
}

fn throughput_of(engine: &ProbeEngine, address: &str) -> proxy_probe_rs::types::ThroughputState {
    engine
        .snapshot()
        .into_iter()
        .find(|r| r.endpoint.address == address)
        .unwrap()
        .throughput
}

fn endpoints(n: usize) -> Vec<Endpoint> {
    (0..n)
        .map(|i| Endpoint::new(format!("10.0.0.{i}"), 1080, TransportType::Socks5))
        .collect()
}

fn engine_with(latency: Arc<CountingProbe>) -> ProbeEngine {
    ProbeEngine::new(latency, Arc::new(SimulatedProbe::seeded(1).with_delay_ms(1..2)))
}

fn count(engine: &ProbeEngine, status: ProbeStatus) -> usize {
    engine
        .snapshot()
        .iter()
        .filter(|r| r.probe.status() == status)
        .count()
}

#[tokio::test]
async fn peak_concurrency_never_exceeds_limit_and_each_endpoint_probed_once() {
    let probe = Arc::new(CountingProbe::new(20));
    let engine = engine_with(probe.clone());
    engine.add_endpoints(&endpoints(23)).unwrap();

    let summary = engine.start_latency_run(5).unwrap().wait().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.completed_count, 23);
    assert_eq!(summary.batches, 5);
    assert_eq!(probe.peak(), 5);

    let calls = probe.calls();
    assert_eq!(calls.len(), 23);
    assert!(calls.values().all(|&n| n == 1));
    assert_eq!(count(&engine, ProbeStatus::Online), 23);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn limit_larger_than_collection_runs_one_batch() {
    let probe = Arc::new(CountingProbe::new(5));
    let engine = engine_with(probe.clone());
    engine.add_endpoints(&endpoints(4)).unwrap();

    let summary = engine.start_latency_run(100).unwrap().wait().await.unwrap();
    assert_eq!(summary.batches, 1);
    assert_eq!(probe.peak(), 4);
}

#[tokio::test]
async fn events_arrive_in_order_with_monotonic_progress() {
    let engine = engine_with(Arc::new(CountingProbe::new(2)));
    engine.add_endpoints(&endpoints(7)).unwrap();
    let mut rx = engine.subscribe();

    let handle = engine.start_latency_run(3).unwrap();
    let run_id = handle.run_id;
    let mut seen = Vec::new();
    loop {
        let ev = rx.recv().await.unwrap();
        let done = matches!(ev, EngineEvent::RunFinished { .. });
        seen.push(ev);
        if done {
            break;
        }
    }
    handle.wait().await.unwrap();

    assert!(matches!(&seen[0], EngineEvent::RunStarted { run } if run.run_id == run_id));
    assert!(matches!(&seen[1], EngineEvent::PhaseReset { phase: Phase::Latency, ids, .. } if ids.len() == 7));
    let progress: Vec<f64> = seen
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ProbeBatch { progress, updates, .. } => {
                assert!(updates.len() <= 3);
                Some(*progress)
            }
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 3);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last().copied(), Some(100.0));
}

#[tokio::test]
async fn cancel_after_first_batch_leaves_the_rest_pending() {
    let probe = Arc::new(CountingProbe::new(50));
    let engine = engine_with(probe);
    engine.add_endpoints(&endpoints(10)).unwrap();
    let mut rx = engine.subscribe();

    let handle = engine.start_latency_run(3).unwrap();
    loop {
        if let EngineEvent::ProbeBatch { batch: 1, .. } = rx.recv().await.unwrap() {
            break;
        }
    }
    assert!(engine.cancel_active_run());
    assert!(!engine.is_running());

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.completed_count, 3);
    assert_eq!(summary.batches, 1);
    assert_eq!(count(&engine, ProbeStatus::Online), 3);
    assert_eq!(count(&engine, ProbeStatus::Pending), 7);

    // No event from the cancelled run reports a second batch.
    while let Ok(ev) = rx.try_recv() {
        assert!(!matches!(ev, EngineEvent::ProbeBatch { batch: 2, .. }));
    }
}

#[tokio::test]
async fn cancel_with_no_run_is_a_no_op() {
    let engine = engine_with(Arc::new(CountingProbe::new(1)));
    assert!(!engine.cancel_active_run());
}

#[tokio::test]
async fn second_start_is_rejected_while_a_run_is_active() {
    let engine = engine_with(Arc::new(CountingProbe::new(30)));
    engine.add_endpoints(&endpoints(4)).unwrap();

    let handle = engine.start_latency_run(2).unwrap();
    assert_eq!(
        engine.start_latency_run(2).err(),
        Some(EngineError::RunActive(Phase::Latency))
    );
    assert_eq!(
        engine.start_throughput_run(2).err(),
        Some(EngineError::RunActive(Phase::Latency))
    );
    assert_eq!(
        engine.add_endpoints(&endpoints(1)).err(),
        Some(EngineError::RunActive(Phase::Latency))
    );
    assert_eq!(engine.clear().err(), Some(EngineError::RunActive(Phase::Latency)));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(engine.snapshot().len(), 4);
}

#[tokio::test]
async fn new_run_can_start_right_after_cancel() {
    let engine = engine_with(Arc::new(CountingProbe::new(40)));
    engine.add_endpoints(&endpoints(6)).unwrap();

    let first = engine.start_latency_run(2).unwrap();
    assert!(engine.cancel_active_run());
    let second = engine.start_latency_run(6).unwrap();
    assert_ne!(first.run_id, second.run_id);

    let first = first.wait().await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.batches, 0);

    let second = second.wait().await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(count(&engine, ProbeStatus::Online), 6);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn start_requires_endpoints_and_a_positive_limit() {
    let engine = engine_with(Arc::new(CountingProbe::new(1)));
    assert_eq!(engine.start_latency_run(5).err(), Some(EngineError::NoEndpoints));
    engine.add_endpoints(&endpoints(1)).unwrap();
    assert_eq!(engine.start_latency_run(0).err(), Some(EngineError::InvalidConcurrency));
}

#[tokio::test]
async fn probe_error_marks_only_that_endpoint() {
    let probe = Arc::new(CountingProbe {
        fail_address: Some("10.0.0.3"),
        ..CountingProbe::new(2)
    });
    let engine = engine_with(probe);
    engine.add_endpoints(&endpoints(6)).unwrap();

    let summary = engine.start_latency_run(4).unwrap().wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    for r in engine.snapshot() {
        if r.endpoint.address == "10.0.0.3" {
            assert_eq!(r.probe.status(), ProbeStatus::Error);
            assert_eq!(r.probe.latency_ms(), None);
        } else {
            assert_eq!(r.probe.status(), ProbeStatus::Online);
        }
    }
}

#[tokio::test]
async fn throughput_skips_endpoints_that_are_not_online() {
    let latency = Arc::new(CountingProbe {
        timeout_address: Some("10.0.0.1"),
        ..CountingProbe::new(1)
    });
    let throughput = Arc::new(RecordingThroughput::default());
    let engine = ProbeEngine::new(latency, throughput.clone());
    let eps = endpoints(2);
    let (a, b) = (eps[0].id, eps[1].id);
    engine.add_endpoints(&eps).unwrap();

    engine.start_latency_run(5).unwrap().wait().await.unwrap();
    let summary = engine.start_throughput_run(5).unwrap().wait().await.unwrap();
    assert_eq!(summary.phase, Phase::Throughput);
    assert_eq!(summary.total_count, 1);

    assert_eq!(*throughput.probed.lock().unwrap(), vec![a]);
    let records = engine.snapshot();
    let rec_a = records.iter().find(|r| r.endpoint.id == a).unwrap();
    let rec_b = records.iter().find(|r| r.endpoint.id == b).unwrap();
    assert_eq!(rec_a.throughput.status, ThroughputStatus::Completed);
    assert_eq!(rec_a.throughput.progress, 100.0);
    assert_eq!(rec_a.throughput.download_speed_mbps, 5.0);
    assert_eq!(rec_b.throughput.status, ThroughputStatus::Failed);
    assert_eq!(rec_b.throughput.progress, 0.0);
}

#[tokio::test]
async fn failed_import_leaves_collection_untouched() {
    let engine = engine_with(Arc::new(CountingProbe::new(1)));
    ingest::import_text(&engine, "paste", "1.2.3.4:80\n5.6.7.8:81", TypeFilter::All).unwrap();
    let before = engine.snapshot();

    let err = ingest::import_text(&engine, "paste", "not an endpoint\n10.0.0:80", TypeFilter::All)
        .unwrap_err();
    assert!(matches!(err, IngestError::NoValidEndpoints { .. }));
    assert_eq!(engine.snapshot(), before);
}

#[tokio::test]
async fn reimport_adds_only_new_keys_in_front() {
    let engine = engine_with(Arc::new(CountingProbe::new(1)));
    ingest::import_text(&engine, "a", "1.2.3.4:80", TypeFilter::All).unwrap();
    let report = ingest::import_text(&engine, "b", "1.2.3.4:80\n9.9.9.9:3128", TypeFilter::All).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.already_present, 1);

    let addrs: Vec<String> = engine.snapshot().into_iter().map(|r| r.endpoint.address).collect();
    assert_eq!(addrs, vec!["9.9.9.9", "1.2.3.4"]);
}

#[tokio::test]
async fn panicking_check_marks_its_endpoint_and_frees_the_engine() {
    let latency = Arc::new(CountingProbe {
        panic_address: Some("10.0.0.1"),
        ..CountingProbe::new(2)
    });
    let engine = engine_with(latency);
    engine.add_endpoints(&endpoints(3)).unwrap();

    let summary = engine.start_latency_run(3).unwrap().wait().await;
    let summary = summary.expect("run task survives a panic");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(!engine.is_running());
    for r in engine.snapshot() {
        let expected = if r.endpoint.address == "10.0.0.1" {
            ProbeStatus::Error
        } else {
            ProbeStatus::Online
        };
        assert_eq!(r.probe.status(), expected);
    }

    let again = engine.start_latency_run(3).unwrap().wait().await.unwrap();
    assert_eq!(again.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn cancelled_error_without_cancel_counts_as_error() {
    let latency = Arc::new(CountingProbe {
        cancelled_address: Some("10.0.0.2"),
        ..CountingProbe::new(2)
    });
    let engine = engine_with(latency);
    engine.add_endpoints(&endpoints(3)).unwrap();

    let summary = engine.start_latency_run(3).unwrap().wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(count(&engine, ProbeStatus::Pending), 0);
    assert_eq!(count(&engine, ProbeStatus::Error), 1);
    assert_eq!(count(&engine, ProbeStatus::Online), 2);
}

#[tokio::test]
async fn throughput_in_flight_stays_within_half_the_limit() {
    let throughput = Arc::new(InstrumentedThroughput::new(10));
    let engine = online_engine(7, throughput.clone()).await;

    let summary = engine.start_throughput_run(5).unwrap().wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.batches, 4);
    assert_eq!(throughput.peak.load(Ordering::SeqCst), 2);
    let calls = throughput.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 7);
    assert!(calls.values().all(|&n| n == 1));
}

#[tokio::test]
async fn throughput_limit_of_one_runs_one_at_a_time() {
    let throughput = Arc::new(InstrumentedThroughput::new(5));
    let engine = online_engine(3, throughput.clone()).await;

    engine.start_throughput_run(1).unwrap().wait().await.unwrap();
    assert_eq!(throughput.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_download_only_fails_its_endpoint() {
    let throughput = Arc::new(InstrumentedThroughput {
        error_address: Some("10.0.0.1"),
        failed_address: Some("10.0.0.2"),
        panic_address: Some("10.0.0.3"),
        ..InstrumentedThroughput::new(5)
    });
    let engine = online_engine(5, throughput).await;

    // Batch size 4 puts four of the five endpoints in the first batch.
    let summary = engine.start_throughput_run(8).unwrap().wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(!engine.is_running());

    for addr in ["10.0.0.1", "10.0.0.3"] {
        let st = throughput_of(&engine, addr);
        assert_eq!(st.status, ThroughputStatus::Failed, "{addr}");
        assert_eq!(st.progress, 30.0, "{addr}");
    }
    let st = throughput_of(&engine, "10.0.0.2");
    assert_eq!(st.status, ThroughputStatus::Failed);
    assert_eq!(st.progress, 30.0);
    assert_eq!(st.download_speed_mbps, 2.0);

    for addr in ["10.0.0.0", "10.0.0.4"] {
        let st = throughput_of(&engine, addr);
        assert_eq!(st.status, ThroughputStatus::Completed, "{addr}");
        assert_eq!(st.progress, 100.0, "{addr}");
        assert_eq!(st.download_speed_mbps, 5.0, "{addr}");
    }
}

#[tokio::test]
async fn cancelled_throughput_run_leaves_nothing_testing() {
    let throughput = Arc::new(InstrumentedThroughput::new(200));
    let engine = online_engine(4, throughput).await;
    let mut rx = engine.subscribe();

    // Limit 4 gives batches of two.
    let handle = engine.start_throughput_run(4).unwrap();
    loop {
        if let EngineEvent::ThroughputProgress { state, .. } = rx.recv().await.unwrap() {
            if state.progress > 0.0 {
                break;
            }
        }
    }
    assert!(engine.cancel_active_run());
    assert!(!engine.is_running());

    let statuses = |engine: &ProbeEngine| -> Vec<ThroughputStatus> {
        engine.snapshot().iter().map(|r| r.throughput.status).collect()
    };
    let right_after_cancel = statuses(&engine);
    assert!(!right_after_cancel.contains(&ThroughputStatus::Testing));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.completed_count, 0);

    let after = statuses(&engine);
    assert_eq!(after.iter().filter(|s| **s == ThroughputStatus::Failed).count(), 2);
    assert_eq!(after.iter().filter(|s| **s == ThroughputStatus::Idle).count(), 2);
    for r in engine.snapshot() {
        if r.throughput.status == ThroughputStatus::Failed {
            assert_eq!(r.throughput.progress, 30.0);
        }
    }
}

#[tokio::test]
async fn throughput_run_reports_eligible_total_from_the_start() {
    let latency = Arc::new(CountingProbe {
        timeout_address: Some("10.0.0.1"),
        ..CountingProbe::new(1)
    });
    let engine = ProbeEngine::new(latency, Arc::new(InstrumentedThroughput::new(20)));
    engine.add_endpoints(&endpoints(3)).unwrap();
    engine.start_latency_run(3).unwrap().wait().await.unwrap();

    let mut rx = engine.subscribe();
    let handle = engine.start_throughput_run(4).unwrap();
    assert_eq!(engine.current_run().map(|r| r.total_count), Some(2));
    match rx.recv().await.unwrap() {
        EngineEvent::RunStarted { run } => assert_eq!(run.total_count, 2),
        other => panic!("unexpected first event: {other:?}"),
    }
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.total_count, 2);
}

#[tokio::test]
async fn latency_rerun_drops_stale_throughput_results() {
    let throughput = Arc::new(InstrumentedThroughput::new(1));
    let engine = online_engine(2, throughput).await;
    engine.start_throughput_run(4).unwrap().wait().await.unwrap();
    assert_eq!(throughput_of(&engine, "10.0.0.0").status, ThroughputStatus::Completed);

    engine.start_latency_run(2).unwrap().wait().await.unwrap();
    let st = throughput_of(&engine, "10.0.0.0");
    assert_eq!(st.status, ThroughputStatus::Idle);
    assert_eq!(st.download_speed_mbps, 0.0);
}
