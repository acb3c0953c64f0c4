use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use proxy_probe_rs::config::{EngineConfig, ProbeMode};
use proxy_probe_rs::engine::{ProbeEngine, RunHandle};
use proxy_probe_rs::events::{EngineEvent, EventReceiver};
use proxy_probe_rs::ingest::{self, RemoteFetcher};
use proxy_probe_rs::types::{EndpointRecord, RunOutcome, RunSummary, ThroughputStatus, TypeFilter};
use proxy_probe_rs::{export, server};

/// proxy-probe-rs: two-phase proxy endpoint prober with a tiny embedded web API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "proxy-probe-rs",
    version,
    about = "Probe proxy endpoints for latency, then throughput, in bounded batches.",
    long_about = None
)]
struct Cli {
    /// File(s) with endpoint lines (`scheme://a.b.c.d:port` or `a.b.c.d:port`).
    #[arg(long)]
    targets: Vec<PathBuf>,

    /// Built-in list(s) to load: default, us, eu.
    #[arg(long)]
    preset: Vec<String>,

    /// Remote endpoint list, fetched through the configured gateways.
    #[arg(long)]
    url: Option<String>,

    /// Keep only one transport type: all, socks5, socks4, http, https.
    #[arg(long = "type-filter", default_value = "all")]
    type_filter: TypeFilter,

    /// Probes per batch. Overrides the config file.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Latency probe timeout in milliseconds. Overrides the config file.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Probe implementation. Overrides the config file.
    #[arg(long, value_enum)]
    probe: Option<ProbeMode>,

    /// Run the throughput phase after the latency phase.
    #[arg(long, default_value_t = false)]
    throughput: bool,

    /// Download size per throughput probe, in MB.
    #[arg(long = "target-size-mb")]
    target_size_mb: Option<f64>,

    /// Write results to this path: JSON for `.json`, CSV otherwise.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Start the embedded HTTP API and UI server.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Server bind address. Overrides the config file.
    #[arg(long)]
    bind: Option<String>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

impl Cli {
    fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(c) = self.concurrency {
            config.concurrency = c;
        }
        if let Some(t) = self.timeout_ms {
            config.timeout_ms = t;
        }
        if let Some(p) = self.probe {
            config.probe_mode = p;
        }
        if let Some(s) = self.target_size_mb {
            config.target_size_mb = s;
        }
        if let Some(b) = &self.bind {
            config.bind = b.clone();
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "proxy_probe_rs=debug,tower_http=debug"
    } else {
        "proxy_probe_rs=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    cli.apply_to(&mut config);

    println!("proxy-probe-rs configuration:");
    println!(
        "  targets      : {}",
        if cli.targets.is_empty() {
            "<none>".to_string()
        } else {
            cli.targets
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!(
        "  presets      : {}",
        if cli.preset.is_empty() {
            "<none>".to_string()
        } else {
            cli.preset.join(", ")
        }
    );
    println!("  url          : {}", cli.url.as_deref().unwrap_or("<none>"));
    println!("  type_filter  : {}", cli.type_filter);
    println!("  concurrency  : {}", config.concurrency());
    println!("  timeout_ms   : {}", config.timeout_ms);
    println!("  probe        : {:?}", config.probe_mode);
    println!("  throughput   : {}", cli.throughput);
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  serve_ui     : {}", cli.serve_ui);

    let engine = Arc::new(ProbeEngine::from_config(&config));
    let fetcher = Arc::new(RemoteFetcher::new(config.gateways.clone(), config.download_timeout())?);

    for path in &cli.targets {
        if let Err(e) = ingest::import_file(&engine, path, cli.type_filter) {
            eprintln!("Skipping {}: {e}", path.display());
        }
    }
    for key in &cli.preset {
        if let Err(e) = ingest::import_preset(&engine, key, cli.type_filter) {
            eprintln!("Skipping preset {key}: {e}");
        }
    }
    if let Some(url) = cli.url.as_deref() {
        if let Err(e) = ingest::import_url(&engine, &fetcher, url, cli.type_filter).await {
            eprintln!("Skipping {url}: {e}");
        }
    }
    let no_sources = cli.targets.is_empty() && cli.preset.is_empty() && cli.url.is_none();
    if no_sources {
        println!("No sources given, loading the default preset.");
        ingest::import_preset(&engine, "default", cli.type_filter)?;
    }

    if cli.serve_ui {
        let state = server::AppState::new(engine.clone(), fetcher.clone(), &config);
        let bind = config.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                error!(error = %e, "HTTP server error");
            }
        });
        println!("UI server starting at http://{} (Ctrl+C to stop)", config.bind);
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
        engine.cancel_active_run();
        return Ok(());
    }

    if engine.stats().total == 0 {
        bail!("no endpoints loaded");
    }

    let printer = tokio::spawn(print_progress(engine.subscribe()));

    let latency = engine.start_latency_run(config.concurrency())?;
    let summary = drive(&engine, latency).await;
    let mut cancelled = summary.as_ref().is_some_and(|s| s.outcome == RunOutcome::Cancelled);

    if cli.throughput && !cancelled {
        let throughput = engine.start_throughput_run(config.concurrency())?;
        let summary = drive(&engine, throughput).await;
        cancelled = summary.as_ref().is_some_and(|s| s.outcome == RunOutcome::Cancelled);
    }
    printer.abort();

    let records = engine.ranked();
    print_results_table(&records);
    let stats = engine.stats();
    println!(
        "\nOnline: {}  Timeout: {}  Error: {}  Pending: {}  (total {})",
        stats.online, stats.timeout, stats.error, stats.pending, stats.total
    );
    if let Some(avg) = stats.avg_latency_ms {
        println!("Average latency: {avg:.0} ms");
    }
    let top = engine.top(5);
    if !top.is_empty() {
        println!("Top performers:");
        for (i, r) in top.iter().enumerate() {
            println!(
                "  {}. {}:{} ({} ms)",
                i + 1,
                r.endpoint.address,
                r.endpoint.port,
                r.probe.latency_ms().unwrap_or_default()
            );
        }
    }
    if cancelled {
        println!("Run was cancelled; remaining endpoints keep their previous state.");
    }

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = export::write_results(path, &records) {
            eprintln!("Failed to write results to {}: {}", path.display(), e);
        } else {
            println!("Wrote results to {}", path.display());
        }
    }

    Ok(())
}

/// Wait for a run; the first Ctrl+C cancels it.
async fn drive(engine: &ProbeEngine, handle: RunHandle) -> Option<RunSummary> {
    let wait = handle.wait();
    tokio::pin!(wait);
    tokio::select! {
        summary = &mut wait => summary,
        _ = tokio::signal::ctrl_c() => {
            println!("\nCancelling...");
            engine.cancel_active_run();
            wait.await
        }
    }
}

async fn print_progress(mut rx: EventReceiver) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::ProbeBatch {
                batch,
                completed,
                total,
                progress,
                ..
            }) => println!("[latency] batch {batch}: {completed}/{total} ({progress:.0}%)"),
            Ok(EngineEvent::ThroughputBatch {
                batch,
                completed,
                total,
                progress,
                ..
            }) => println!("[throughput] batch {batch}: {completed}/{total} ({progress:.0}%)"),
            Ok(EngineEvent::ThroughputExcluded { ids, .. }) if !ids.is_empty() => {
                println!("[throughput] {} endpoint(s) not online, marked failed", ids.len())
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "progress printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_results_table(records: &[EndpointRecord]) {
    let mut addr_w = "address".len();
    for r in records {
        addr_w = addr_w.max(r.endpoint.address.len());
    }
    let port_w = 5usize;
    let type_w = "socks5".len().max("type".len());
    let status_w = "TIMEOUT".len();
    let lat_w = "latency_ms".len();
    let speed_w = "speed_mbps".len();

    println!("\nResults: {}", records.len());
    println!(
        "{:<addr_w$}  {:>port_w$}  {:<type_w$}  {:<status_w$}  {:>lat_w$}  {:>speed_w$}",
        "address", "port", "type", "status", "latency_ms", "speed_mbps",
    );
    println!(
        "{:-<addr_w$}  {:-<port_w$}  {:-<type_w$}  {:-<status_w$}  {:-<lat_w$}  {:-<speed_w$}",
        "", "", "", "", "", "",
    );
    for r in records {
        let latency = r
            .probe
            .latency_ms()
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".into());
        let speed = match r.throughput.status {
            ThroughputStatus::Completed => format!("{:.2}", r.throughput.download_speed_mbps),
            ThroughputStatus::Failed => "failed".into(),
            _ => "-".into(),
        };
        println!(
            "{:<addr_w$}  {:>port_w$}  {:<type_w$}  {:<status_w$}  {:>lat_w$}  {:>speed_w$}",
            r.endpoint.address,
            r.endpoint.port,
            r.endpoint.transport.as_str(),
            r.probe.status().as_str(),
            latency,
            speed,
        );
    }
}
