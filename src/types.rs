use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque endpoint identity, stable for the endpoint's lifetime.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Socks5,
    Socks4,
    Http,
    Https,
    #[default]
    Unknown,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Socks5 => "socks5",
            TransportType::Socks4 => "socks4",
            TransportType::Http => "http",
            TransportType::Https => "https",
            TransportType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" => Ok(TransportType::Socks5),
            "socks4" => Ok(TransportType::Socks4),
            "http" => Ok(TransportType::Http),
            "https" => Ok(TransportType::Https),
            "unknown" => Ok(TransportType::Unknown),
            other => Err(format!("unknown transport type: {other}")),
        }
    }
}

/// Parser filter: either every transport or one specific type.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String", into = "String")]
pub enum TypeFilter {
    #[default]
    All,
    Only(TransportType),
}

impl FromStr for TypeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(TypeFilter::All);
        }
        s.parse().map(TypeFilter::Only)
    }
}

impl TryFrom<String> for TypeFilter {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TypeFilter> for String {
    fn from(filter: TypeFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for TypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeFilter::All => f.write_str("all"),
            TypeFilter::Only(t) => t.fmt(f),
        }
    }
}

/// One endpoint under test. `(address, port)` is the dedup key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub address: String,
    pub port: u16,
    pub transport: TransportType,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, transport: TransportType) -> Self {
        Self {
            id: EndpointId::new(),
            address: address.into(),
            port,
            transport,
        }
    }

    pub fn key(&self) -> (&str, u16) {
        (self.address.as_str(), self.port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    #[default]
    Pending,
    Online,
    Timeout,
    Error,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Pending => "PENDING",
            ProbeStatus::Online => "ONLINE",
            ProbeStatus::Timeout => "TIMEOUT",
            ProbeStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency phase state. `latency_ms` is only ever set for `Online`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeState {
    status: ProbeStatus,
    latency_ms: Option<u64>,
}

impl ProbeState {
    pub const PENDING: ProbeState = ProbeState {
        status: ProbeStatus::Pending,
        latency_ms: None,
    };

    pub fn online(latency_ms: u64) -> Self {
        Self {
            status: ProbeStatus::Online,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: ProbeStatus::Timeout,
            latency_ms: None,
        }
    }

    pub fn error() -> Self {
        Self {
            status: ProbeStatus::Error,
            latency_ms: None,
        }
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn is_online(&self) -> bool {
        self.status == ProbeStatus::Online
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThroughputStatus {
    #[default]
    Idle,
    Testing,
    Completed,
    Failed,
}

impl ThroughputStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ThroughputStatus::Completed | ThroughputStatus::Failed)
    }
}

/// Throughput phase state for one endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ThroughputState {
    pub status: ThroughputStatus,
    pub progress: f64,
    pub download_speed_mbps: f64,
    pub target_size_mb: f64,
}

impl ThroughputState {
    pub const DEFAULT_TARGET_SIZE_MB: f64 = 10.0;

    pub fn idle(target_size_mb: f64) -> Self {
        Self {
            status: ThroughputStatus::Idle,
            progress: 0.0,
            download_speed_mbps: 0.0,
            target_size_mb,
        }
    }
}

impl Default for ThroughputState {
    fn default() -> Self {
        Self::idle(Self::DEFAULT_TARGET_SIZE_MB)
    }
}

/// Partial throughput update; `None` fields leave the stored value alone.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct ThroughputUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ThroughputStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_size_mb: Option<f64>,
}

impl ThroughputUpdate {
    pub fn status(status: ThroughputStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64, download_speed_mbps: f64) -> Self {
        Self {
            progress: Some(progress),
            download_speed_mbps: Some(download_speed_mbps),
            ..Default::default()
        }
    }
}

/// An endpoint together with the results of both phases.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    pub endpoint: Endpoint,
    pub probe: ProbeState,
    pub throughput: ThroughputState,
}

impl EndpointRecord {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            probe: ProbeState::PENDING,
            throughput: ThroughputState::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Latency,
    Throughput,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Latency => f.write_str("latency"),
            Phase::Throughput => f.write_str("throughput"),
        }
    }
}

/// Snapshot of the active run, as published to callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: u64,
    pub phase: Phase,
    pub concurrency_limit: usize,
    pub completed_count: u64,
    pub total_count: u64,
    pub cancellation_requested: bool,
    pub started_at: String,
}

impl RunState {
    pub fn progress(&self) -> f64 {
        progress_percent(self.completed_count, self.total_count)
    }
}

/// `min(100, completed / total * 100)`; an empty run counts as finished.
pub fn progress_percent(completed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (completed as f64 / total as f64 * 100.0).min(100.0)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Terminal summary of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: u64,
    pub phase: Phase,
    pub outcome: RunOutcome,
    pub total_count: u64,
    pub completed_count: u64,
    pub batches: u64,
    pub elapsed_ms: u64,
}
