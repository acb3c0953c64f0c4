//! Probe implementations: the pluggable per-endpoint checks the scheduler drives.
//!
//! A latency probe resolves to a terminal [`ProbeState`]. A throughput probe
//! streams `(progress, MB/s)` through a [`ProgressReporter`] and resolves to a
//! [`ThroughputOutcome`]. Neither is interrupted by the scheduler, so each
//! implementation bounds its own worst-case duration.

use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{Endpoint, ProbeState, TransportType};

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("transport {0} is not supported by this probe")]
    Unsupported(TransportType),
    #[error("probe cancelled")]
    Cancelled,
}

/// How a throughput probe ended when it did not error out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThroughputOutcome {
    Completed { final_speed_mbps: f64 },
    Failed { last_speed_mbps: f64 },
}

#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<ProbeState, ProbeError>;
}

#[async_trait]
pub trait ThroughputProbe: Send + Sync {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        target_size_mb: f64,
        reporter: &ProgressReporter<'_>,
    ) -> Result<ThroughputOutcome, ProbeError>;
}

/// Callback handle given to throughput probes. Reports after cancellation are dropped.
pub struct ProgressReporter<'a> {
    cancel: &'a CancellationToken,
    sink: &'a (dyn Fn(f64, f64) + Send + Sync),
}

impl<'a> ProgressReporter<'a> {
    pub fn new(cancel: &'a CancellationToken, sink: &'a (dyn Fn(f64, f64) + Send + Sync)) -> Self {
        Self { cancel, sink }
    }

    pub fn report(&self, progress: f64, speed_mbps: f64) {
        if self.cancel.is_cancelled() {
            return;
        }
        (self.sink)(progress.clamp(0.0, 100.0), speed_mbps.max(0.0));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Randomized stand-in for real probing.
///
/// Latency: 200..1200 ms wait, then 30% TIMEOUT, 10% ERROR, otherwise ONLINE
/// at 50..450 ms (10..60 ms for the fastest tenth).
/// Throughput: ten steps reporting progress and a 0.5..12 MB/s speed, with a
/// 15% chance of failing part-way.
pub struct SimulatedProbe {
    rng: Mutex<StdRng>,
    delay_ms: Range<u64>,
    steps: u32,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            delay_ms: 200..1200,
            steps: 10,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: Range<u64>) -> Self {
        if delay_ms.start < delay_ms.end {
            self.delay_ms = delay_ms;
        }
        self
    }

    fn draw_latency(&self) -> (Duration, ProbeState) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let delay = Duration::from_millis(rng.gen_range(self.delay_ms.clone()));
        let roll: f64 = rng.gen();
        let state = if roll > 0.7 {
            ProbeState::timeout()
        } else if roll > 0.6 {
            ProbeState::error()
        } else if roll < 0.1 {
            ProbeState::online(rng.gen_range(10..60))
        } else {
            ProbeState::online(rng.gen_range(50..450))
        };
        (delay, state)
    }

    fn draw_throughput_plan(&self) -> (Duration, Option<u32>, Vec<f64>) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let step = Duration::from_millis(rng.gen_range(self.delay_ms.clone()) / self.steps as u64);
        let fail_at = rng.gen_bool(0.15).then(|| rng.gen_range(1..=self.steps));
        let speeds = (0..self.steps).map(|_| rng.gen_range(0.5..12.0)).collect();
        (step, fail_at, speeds)
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LatencyProbe for SimulatedProbe {
    async fn probe(
        &self,
        _endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<ProbeState, ProbeError> {
        let (delay, state) = self.draw_latency();
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        time::sleep(delay).await;
        Ok(state)
    }
}

#[async_trait]
impl ThroughputProbe for SimulatedProbe {
    async fn probe(
        &self,
        _endpoint: &Endpoint,
        _target_size_mb: f64,
        reporter: &ProgressReporter<'_>,
    ) -> Result<ThroughputOutcome, ProbeError> {
        let (step, fail_at, speeds) = self.draw_throughput_plan();
        let mut last_speed = 0.0;
        for (i, speed) in speeds.iter().copied().enumerate() {
            let n = i as u32 + 1;
            if reporter.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            time::sleep(step).await;
            if fail_at == Some(n) {
                return Ok(ThroughputOutcome::Failed {
                    last_speed_mbps: last_speed,
                });
            }
            last_speed = speed;
            reporter.report(n as f64 / self.steps as f64 * 100.0, speed);
        }
        let avg = speeds.iter().sum::<f64>() / speeds.len().max(1) as f64;
        Ok(ThroughputOutcome::Completed {
            final_speed_mbps: avg,
        })
    }
}

/// Real reachability check: a TCP connect bounded by `timeout`.
///
/// Connect timeout maps to TIMEOUT, refused/unreachable to ERROR. SOCKS5
/// endpoints must also accept a no-auth greeting.
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LatencyProbe for TcpConnectProbe {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<ProbeState, ProbeError> {
        let ip: IpAddr = endpoint.address.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}: {e}", endpoint.address))
        })?;
        let addr = SocketAddr::new(ip, endpoint.port);

        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let start = Instant::now();
        let mut stream = match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(endpoint = %addr, error = %e, "connect failed");
                return Ok(ProbeState::error());
            }
            Err(_) => return Ok(ProbeState::timeout()),
        };

        if endpoint.transport == TransportType::Socks5 {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            let remaining = self.timeout.saturating_sub(start.elapsed());
            match time::timeout(remaining, socks5_greeting(&mut stream)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(endpoint = %addr, error = %e, "socks5 greeting failed");
                    return Ok(ProbeState::error());
                }
                Err(_) => return Ok(ProbeState::timeout()),
            }
        }

        let latency_ms = start.elapsed().as_millis().max(1) as u64;
        Ok(ProbeState::online(latency_ms))
    }
}

async fn socks5_greeting(stream: &mut TcpStream) -> Result<(), ProbeError> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(ProbeError::Handshake(format!(
            "unexpected reply {:02x} {:02x}",
            reply[0], reply[1]
        )));
    }
    Ok(())
}

/// Real throughput check: download `url` through the endpoint used as a proxy.
pub struct HttpThroughputProbe {
    url: String,
    timeout: Duration,
}

impl HttpThroughputProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

fn proxy_url(endpoint: &Endpoint) -> Result<String, ProbeError> {
    let scheme = match endpoint.transport {
        TransportType::Socks5 => "socks5",
        TransportType::Http | TransportType::Unknown => "http",
        TransportType::Https => "https",
        TransportType::Socks4 => return Err(ProbeError::Unsupported(TransportType::Socks4)),
    };
    Ok(format!("{scheme}://{}:{}", endpoint.address, endpoint.port))
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / BYTES_PER_MB / secs
}

#[async_trait]
impl ThroughputProbe for HttpThroughputProbe {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        target_size_mb: f64,
        reporter: &ProgressReporter<'_>,
    ) -> Result<ThroughputOutcome, ProbeError> {
        let proxy = reqwest::Proxy::all(proxy_url(endpoint)?)
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        if reporter.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let mut response = client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Http(e.to_string())
                }
            })?;

        let target_bytes = (target_size_mb * BYTES_PER_MB).max(1.0) as u64;
        let expected = response
            .content_length()
            .map(|len| len.clamp(1, target_bytes))
            .unwrap_or(target_bytes);

        let start = Instant::now();
        let mut received: u64 = 0;
        let mut speed = 0.0;
        while received < expected {
            if reporter.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    debug!(endpoint = %endpoint.address, error = %e, "download interrupted");
                    return Ok(ThroughputOutcome::Failed {
                        last_speed_mbps: speed,
                    });
                }
            };
            received += chunk.len() as u64;
            speed = mbps(received, start.elapsed());
            reporter.report(
                (received as f64 / expected as f64 * 100.0).min(100.0),
                speed,
            );
        }

        if received == 0 {
            return Ok(ThroughputOutcome::Failed {
                last_speed_mbps: 0.0,
            });
        }
        Ok(ThroughputOutcome::Completed {
            final_speed_mbps: speed,
        })
    }
}
