use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::Path;

use crate::types::{EndpointRecord, ThroughputStatus};

pub const CSV_HEADER: &str = "address,port,status,latencyMs,speedMBps";

/// Render records as CSV, one row per record in the given order.
pub fn render_csv(records: &[EndpointRecord]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + records.len() * 40);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for r in records {
        let latency = r
            .probe
            .latency_ms()
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "N/A".into());
        let speed = if r.throughput.status == ThroughputStatus::Completed {
            format!("{:.2}", r.throughput.download_speed_mbps)
        } else {
            "N/A".into()
        };
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            r.endpoint.address,
            r.endpoint.port,
            r.probe.status(),
            latency,
            speed
        );
    }
    out
}

/// Write records to `path`: pretty JSON for a `.json` extension, CSV otherwise.
pub fn write_results(path: &Path, records: &[EndpointRecord]) -> Result<()> {
    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, records)?;
    } else {
        fs::write(path, render_csv(records)).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, ProbeState, ThroughputState, TransportType};

    #[test]
    fn rows_follow_record_order_and_mark_missing_values() {
        let mut a = EndpointRecord::new(Endpoint::new("1.1.1.1", 1080, TransportType::Socks5));
        a.probe = ProbeState::online(87);
        a.throughput = ThroughputState {
            status: ThroughputStatus::Completed,
            progress: 100.0,
            download_speed_mbps: 3.456,
            target_size_mb: 10.0,
        };
        let mut b = EndpointRecord::new(Endpoint::new("2.2.2.2", 8080, TransportType::Http));
        b.probe = ProbeState::timeout();

        let csv = render_csv(&[a, b]);
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "1.1.1.1,1080,ONLINE,87,3.46");
        assert_eq!(lines[2], "2.2.2.2,8080,TIMEOUT,N/A,N/A");
        assert_eq!(lines.len(), 3);
    }
}
