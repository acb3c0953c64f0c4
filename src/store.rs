use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::merge::merge;
use crate::types::{
    Endpoint, EndpointId, EndpointRecord, ProbeState, ProbeStatus, ThroughputState,
    ThroughputStatus, ThroughputUpdate,
};

/// Store handle shared between the engine, the scheduler and probe callbacks.
pub type SharedStore = Arc<Mutex<EndpointStore>>;

pub fn shared(store: EndpointStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock the store, recovering the data if a previous holder panicked.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, EndpointStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters over the latency phase results.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub total: usize,
    pub pending: usize,
    pub online: usize,
    pub timeout: usize,
    pub error: usize,
    pub avg_latency_ms: Option<f64>,
}

/// Authoritative endpoint collection with per-endpoint phase results.
///
/// Updates merge by endpoint id and only touch the fields they carry.
#[derive(Debug, Default)]
pub struct EndpointStore {
    records: Vec<EndpointRecord>,
    index: HashMap<EndpointId, usize>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EndpointRecord] {
        &self.records
    }

    pub fn get(&self, id: &EndpointId) -> Option<&EndpointRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.records.iter().map(|r| r.endpoint.clone()).collect()
    }

    /// Put new endpoints ahead of the existing ones. Keys already present are
    /// skipped. Returns how many were added.
    pub fn insert_front(&mut self, incoming: &[Endpoint]) -> usize {
        let fresh = merge(&self.endpoints(), incoming);
        let added = fresh.len();
        if added == 0 {
            return 0;
        }
        let mut records: Vec<EndpointRecord> = fresh.into_iter().map(EndpointRecord::new).collect();
        records.append(&mut self.records);
        self.records = records;
        self.reindex();
        added
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.records.len();
        self.records.clear();
        self.index.clear();
        removed
    }

    /// Merge latency results by id. Unknown ids are ignored; for repeated ids
    /// the last one wins. Returns the number of records touched.
    pub fn apply_probe_results<I>(&mut self, updates: I) -> usize
    where
        I: IntoIterator<Item = (EndpointId, ProbeState)>,
    {
        let mut applied = 0;
        for (id, state) in updates {
            if let Some(&i) = self.index.get(&id) {
                self.records[i].probe = state;
                applied += 1;
            }
        }
        applied
    }

    /// Start of a latency run: back to PENDING, and throughput results from an
    /// earlier run are dropped since they no longer match the probe state.
    pub fn reset_phase_results<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = EndpointId>,
    {
        let mut reset = 0;
        for id in ids {
            if let Some(&i) = self.index.get(&id) {
                let record = &mut self.records[i];
                record.probe = ProbeState::PENDING;
                record.throughput = ThroughputState::idle(record.throughput.target_size_mb);
                reset += 1;
            }
        }
        reset
    }

    /// Move every record still in TESTING to FAILED, progress frozen.
    /// Returns the settled records' new states.
    pub fn fail_in_progress(&mut self) -> Vec<(EndpointId, ThroughputState)> {
        let testing: Vec<EndpointId> = self
            .records
            .iter()
            .filter(|r| r.throughput.status == ThroughputStatus::Testing)
            .map(|r| r.endpoint.id)
            .collect();
        testing
            .into_iter()
            .filter_map(|id| {
                self.apply_throughput_update(&id, ThroughputUpdate::status(ThroughputStatus::Failed))
                    .map(|state| (id, state))
            })
            .collect()
    }

    /// Merge a partial throughput update into one record and return the result.
    ///
    /// `Completed` pins progress at 100. `Failed` freezes progress at its last
    /// value, and a failed record ignores progress and speed until a later
    /// update moves it out of `Failed`.
    pub fn apply_throughput_update(
        &mut self,
        id: &EndpointId,
        update: ThroughputUpdate,
    ) -> Option<ThroughputState> {
        let i = *self.index.get(id)?;
        let state = &mut self.records[i].throughput;

        let stays_failed = state.status == ThroughputStatus::Failed
            && update.status.map_or(true, |s| s == ThroughputStatus::Failed);
        if stays_failed {
            return Some(*state);
        }

        if let Some(status) = update.status {
            state.status = status;
        }
        if let Some(target) = update.target_size_mb.filter(|t| *t > 0.0) {
            state.target_size_mb = target;
        }
        if let Some(speed) = update.download_speed_mbps {
            state.download_speed_mbps = speed.max(0.0);
        }
        match state.status {
            ThroughputStatus::Completed => state.progress = 100.0,
            ThroughputStatus::Failed => {}
            ThroughputStatus::Idle | ThroughputStatus::Testing => {
                if let Some(progress) = update.progress {
                    state.progress = progress.clamp(0.0, 100.0);
                }
            }
        }
        Some(*state)
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            total: self.records.len(),
            ..Default::default()
        };
        let mut latency_sum = 0u64;
        let mut latency_n = 0u64;
        for r in &self.records {
            match r.probe.status() {
                ProbeStatus::Pending => stats.pending += 1,
                ProbeStatus::Online => stats.online += 1,
                ProbeStatus::Timeout => stats.timeout += 1,
                ProbeStatus::Error => stats.error += 1,
            }
            if let Some(ms) = r.probe.latency_ms() {
                latency_sum += ms;
                latency_n += 1;
            }
        }
        if latency_n > 0 {
            stats.avg_latency_ms = Some(latency_sum as f64 / latency_n as f64);
        }
        stats
    }

    /// Display order: ONLINE by ascending latency, then everything else in
    /// collection order.
    pub fn ranked(&self) -> Vec<EndpointRecord> {
        let mut out = self.records.clone();
        out.sort_by_key(|r| match r.probe.latency_ms() {
            Some(ms) if r.probe.is_online() => (0u8, ms),
            _ => (1u8, 0),
        });
        out
    }

    /// The `n` fastest ONLINE endpoints.
    pub fn top(&self, n: usize) -> Vec<EndpointRecord> {
        self.ranked()
            .into_iter()
            .take_while(|r| r.probe.is_online())
            .take(n)
            .collect()
    }

    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.endpoint.id, i))
            .collect();
    }
}
