//! Engine configuration, loaded from JSON and overridden by CLI flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Upper bound on probes in flight per batch.
pub const MAX_CONCURRENCY: usize = 5_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Randomized probes, no network traffic.
    #[default]
    Simulated,
    /// TCP connect for latency, HTTP download through the proxy for throughput.
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub target_size_mb: f64,
    pub speed_test_url: String,
    /// Fetch URL templates tried in order; `{url}` is replaced with the
    /// percent-encoded source URL.
    pub gateways: Vec<String>,
    pub probe_mode: ProbeMode,
    pub bind: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout_ms: 2_000,
            download_timeout_ms: 30_000,
            target_size_mb: 10.0,
            speed_test_url: "https://speed.cloudflare.com/__down?bytes=10485760".into(),
            gateways: vec![
                "{url}".into(),
                "https://api.allorigins.win/raw?url={url}".into(),
                "https://corsproxy.io/?url={url}".into(),
                "https://api.codetabs.com/v1/proxy?quest={url}".into(),
            ],
            probe_mode: ProbeMode::Simulated,
            bind: "127.0.0.1:8080".into(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`. A missing file gives defaults; a malformed one logs a
    /// warning and gives defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file is invalid, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}
