use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::OnceLock;

use crate::types::{Endpoint, TransportType, TypeFilter};

/// Port used when a line's port field does not parse.
pub const FALLBACK_PORT: u16 = 1080;

/// Outcome of one parse call: the endpoints plus per-reason drop counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    pub endpoints: Vec<Endpoint>,
    pub skipped_by_filter: usize,
    pub skipped_duplicates: usize,
    pub skipped_invalid: usize,
}

fn scheme_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(socks5|socks4|https|http)://(\d{1,3}(?:\.\d{1,3}){3}):(.*)$")
            .expect("scheme pattern is valid")
    })
}

fn bare_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,3}(?:\.\d{1,3}){3}):(.*)$").expect("bare pattern is valid")
    })
}

/// Parse raw text into endpoints, dropping filtered, invalid and duplicate lines.
///
/// Supported formats per line:
/// - `scheme://a.b.c.d:port` with scheme one of socks5, socks4, http, https (any case)
/// - `a.b.c.d:port`, typed from the filter (or `unknown` when the filter is `all`)
///
/// A port that fails to parse falls back to [`FALLBACK_PORT`]. The first
/// occurrence of an `(address, port)` pair wins.
pub fn parse_with_report(raw: &str, filter: TypeFilter) -> ParseReport {
    let mut report = ParseReport::default();
    let mut seen: HashSet<(String, u16)> = HashSet::new();

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((address, port, transport)) = match_line(line, filter) else {
            report.skipped_invalid += 1;
            continue;
        };

        if let TypeFilter::Only(wanted) = filter {
            if transport != wanted {
                report.skipped_by_filter += 1;
                continue;
            }
        }

        if !seen.insert((address.to_string(), port)) {
            report.skipped_duplicates += 1;
            continue;
        }

        report
            .endpoints
            .push(Endpoint::new(address, port, transport));
    }

    report
}

/// Convenience wrapper over [`parse_with_report`] returning only the endpoints.
pub fn parse(raw: &str, filter: TypeFilter) -> Vec<Endpoint> {
    parse_with_report(raw, filter).endpoints
}

/// Load and parse an endpoint list from a file.
pub fn load_endpoints_from_path(path: impl AsRef<Path>, filter: TypeFilter) -> Result<ParseReport> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read endpoints file: {}", path.as_ref().display()))?;
    Ok(parse_with_report(&content, filter))
}

fn match_line(line: &str, filter: TypeFilter) -> Option<(&str, u16, TransportType)> {
    if let Some(caps) = scheme_pattern().captures(line) {
        let transport = caps[1].parse().unwrap_or(TransportType::Unknown);
        let address = valid_ipv4(caps.get(2)?.as_str())?;
        let port = parse_port_or_fallback(caps.get(3)?.as_str());
        return Some((address, port, transport));
    }

    let caps = bare_pattern().captures(line)?;
    let transport = match filter {
        TypeFilter::All => TransportType::Unknown,
        TypeFilter::Only(t) => t,
    };
    let address = valid_ipv4(caps.get(1)?.as_str())?;
    let port = parse_port_or_fallback(caps.get(2)?.as_str());
    Some((address, port, transport))
}

/// The pattern only shapes a dotted quad; octets above 255 are rejected here.
fn valid_ipv4(address: &str) -> Option<&str> {
    address.parse::<Ipv4Addr>().ok().map(|_| address)
}

fn parse_port_or_fallback(s: &str) -> u16 {
    match s.trim().parse::<u16>() {
        Ok(p) if p != 0 => p,
        _ => FALLBACK_PORT,
    }
}
