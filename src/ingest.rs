//! Getting endpoints into the engine: pasted text, presets, files and remote lists.
//!
//! Every source goes through [`crate::parser`] and then the engine's merge, so
//! a failed ingestion never touches the existing collection.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::form_urlencoded::byte_serialize;

use crate::engine::{EngineError, ProbeEngine};
use crate::events::EngineEvent;
use crate::parser::{parse_with_report, ParseReport};
use crate::presets;
use crate::types::TypeFilter;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no valid endpoints found in {origin}")]
    NoValidEndpoints { origin: String },
    #[error("unknown preset: {0}")]
    UnknownPreset(String),
    #[error("all {} gateways failed for {url}: {}", attempts.len(), attempts.join("; "))]
    AllGatewaysFailed { url: String, attempts: Vec<String> },
    #[error("failed to read {path}: {error}")]
    Io { path: String, error: std::io::Error },
    #[error("http client error: {0}")]
    Client(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What one ingestion did to the collection.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub origin: String,
    pub parsed: usize,
    pub added: usize,
    pub already_present: usize,
    pub skipped_duplicates: usize,
    pub skipped_by_filter: usize,
    pub skipped_invalid: usize,
}

/// Parse `raw` and merge the result into the engine's collection.
pub fn import_text(
    engine: &ProbeEngine,
    origin: &str,
    raw: &str,
    filter: TypeFilter,
) -> Result<ImportReport, IngestError> {
    let report = parse_with_report(raw, filter);
    import_report(engine, origin, report)
}

pub fn import_preset(engine: &ProbeEngine, key: &str, filter: TypeFilter) -> Result<ImportReport, IngestError> {
    let Some(preset) = presets::find(key) else {
        let err = IngestError::UnknownPreset(key.to_string());
        fail(engine, &format!("preset:{key}"), &err);
        return Err(err);
    };
    import_text(engine, &format!("preset:{}", preset.label), preset.raw, filter)
}

pub fn import_file(engine: &ProbeEngine, path: impl AsRef<Path>, filter: TypeFilter) -> Result<ImportReport, IngestError> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    match std::fs::read_to_string(path) {
        Ok(raw) => import_text(engine, &origin, &raw, filter),
        Err(error) => {
            let err = IngestError::Io {
                path: origin.clone(),
                error,
            };
            fail(engine, &origin, &err);
            Err(err)
        }
    }
}

pub async fn import_url(
    engine: &ProbeEngine,
    fetcher: &RemoteFetcher,
    url: &str,
    filter: TypeFilter,
) -> Result<ImportReport, IngestError> {
    match fetcher.fetch(url).await {
        Ok(raw) => import_text(engine, url, &raw, filter),
        Err(err) => {
            fail(engine, url, &err);
            Err(err)
        }
    }
}

fn import_report(engine: &ProbeEngine, origin: &str, report: ParseReport) -> Result<ImportReport, IngestError> {
    if report.endpoints.is_empty() {
        let err = IngestError::NoValidEndpoints {
            origin: origin.to_string(),
        };
        fail(engine, origin, &err);
        return Err(err);
    }
    if report.skipped_by_filter > 0 {
        debug!(origin, skipped = report.skipped_by_filter, "lines skipped by type filter");
    }

    let parsed = report.endpoints.len();
    let added = match engine.add_endpoints(&report.endpoints) {
        Ok(added) => added,
        Err(e) => {
            let err = IngestError::from(e);
            fail(engine, origin, &err);
            return Err(err);
        }
    };

    let out = ImportReport {
        origin: origin.to_string(),
        parsed,
        added,
        already_present: parsed - added,
        skipped_duplicates: report.skipped_duplicates,
        skipped_by_filter: report.skipped_by_filter,
        skipped_invalid: report.skipped_invalid,
    };
    info!(
        origin,
        added = out.added,
        already_present = out.already_present,
        skipped_by_filter = out.skipped_by_filter,
        "endpoints imported"
    );
    engine.publish(EngineEvent::EndpointsAdded {
        origin: out.origin.clone(),
        added: out.added,
        skipped_duplicates: out.skipped_duplicates,
        skipped_by_filter: out.skipped_by_filter,
        skipped_invalid: out.skipped_invalid,
    });
    Ok(out)
}

fn fail(engine: &ProbeEngine, origin: &str, err: &IngestError) {
    warn!(origin, error = %err, "ingestion failed");
    engine.publish(EngineEvent::IngestFailed {
        origin: origin.to_string(),
        message: err.to_string(),
    });
}

/// Fetches remote endpoint lists through a sequence of pass-through gateways.
pub struct RemoteFetcher {
    client: reqwest::Client,
    gateways: Vec<String>,
}

impl RemoteFetcher {
    pub fn new(gateways: Vec<String>, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Client(e.to_string()))?;
        Ok(Self { client, gateways })
    }

    /// The request URLs tried for `url`, in order.
    pub fn gateway_urls(&self, url: &str) -> Vec<String> {
        let encoded: String = byte_serialize(url.as_bytes()).collect();
        self.gateways
            .iter()
            .map(|g| {
                if g.trim() == "{url}" {
                    url.to_string()
                } else {
                    g.replace("{url}", &encoded)
                }
            })
            .collect()
    }

    /// Return the first non-empty body, or every attempt's error.
    pub async fn fetch(&self, url: &str) -> Result<String, IngestError> {
        let mut attempts = Vec::new();
        for target in self.gateway_urls(url) {
            debug!(gateway = %target, "fetching endpoint list");
            match self.fetch_one(&target).await {
                Ok(body) if !body.trim().is_empty() => return Ok(body),
                Ok(_) => attempts.push(format!("{target}: empty response")),
                Err(e) => attempts.push(format!("{target}: {e}")),
            }
        }
        Err(IngestError::AllGatewaysFailed {
            url: url.to_string(),
            attempts,
        })
    }

    async fn fetch_one(&self, target: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(target)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}
