//! Parsing of Caddy's structured (JSON) access and error logs
//!
//! Every line is an independent JSON object; lines that are not, or that lack the fields a
//! record needs, are skipped.

use crate::error::AnalysisError;
use crate::events::{AccessRecord, ErrorRecord, Timestamp};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Unix(f64),
    Text(String),
}

impl RawTimestamp {
    fn to_utc(&self) -> Option<Timestamp> {
        match self {
            RawTimestamp::Unix(seconds) if seconds.is_finite() && *seconds >= 0.0 => {
                let whole = seconds.trunc() as i64;
                let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
                Utc.timestamp_opt(whole, nanos).single()
            }
            RawTimestamp::Unix(_) => None,
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawRequest {
    #[serde(default)]
    remote_ip: Option<String>,
    #[serde(default)]
    client_ip: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    headers: HashMap<String, Vec<String>>,
}

impl RawRequest {
    fn client(&self) -> String {
        self.client_ip
            .clone()
            .or_else(|| self.remote_ip.clone())
            .unwrap_or_default()
    }

    fn user_agent(&self) -> String {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
            .and_then(|(_, values)| values.first().cloned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    ts: Option<RawTimestamp>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    request: Option<RawRequest>,
    /// Seconds
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    status: Option<u16>,
}

/// Parse one access log line
pub fn parse_access_line(line: &str) -> Option<AccessRecord> {
    let entry: RawEntry = serde_json::from_str(line.trim()).ok()?;
    let request = entry.request?;
    let status = entry.status?;
    let timestamp = entry.ts?.to_utc()?;
    Some(AccessRecord {
        client_ip: request.client(),
        timestamp,
        method: request.method.clone().unwrap_or_default(),
        path: request.uri.clone().unwrap_or_default(),
        status,
        bytes_sent: entry.size.unwrap_or(0),
        latency_ms: entry.duration.unwrap_or(0.0) * 1000.0,
        user_agent: request.user_agent(),
    })
}

/// Parse one error log line; entries below `error` level are not errors
pub fn parse_error_line(line: &str) -> Option<ErrorRecord> {
    let raw = line.trim();
    let entry: RawEntry = serde_json::from_str(raw).ok()?;
    let level = entry.level.as_deref().unwrap_or("error");
    if !matches!(level, "error" | "fatal" | "panic") {
        return None;
    }
    let timestamp = entry.ts?.to_utc()?;
    let request = entry.request.unwrap_or_default();
    Some(ErrorRecord {
        timestamp,
        status: entry.status.unwrap_or(0),
        path: request.uri.clone().unwrap_or_default(),
        client_ip: request.client(),
        message: entry.msg.unwrap_or_default(),
        raw: raw.to_string(),
    })
}

/// Whether `line` is a JSON log entry at all, whatever its level
fn is_log_entry(line: &str) -> bool {
    serde_json::from_str::<RawEntry>(line.trim()).is_ok()
}

fn read_records<T>(path: &Path, parse: fn(&str) -> Option<T>) -> Result<Vec<T>, AnalysisError> {
    let file = File::open(path).map_err(|e| {
        AnalysisError::LogUnavailable(format!("{}: {}", path.display(), e))
    })?;

    let mut records = Vec::new();
    let mut lines = 0usize;
    let mut entries = 0usize;
    let mut undecodable = 0usize;
    for raw in BufReader::new(file).split(b'\n') {
        let raw = raw?;
        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(_) => {
                lines += 1;
                undecodable += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        if let Some(record) = parse(line) {
            records.push(record);
        }
        if is_log_entry(line) {
            entries += 1;
        }
    }
    debug!(
        "Read {} record(s) from {} ({} log entries, {} line(s), {} not UTF-8)",
        records.len(),
        path.display(),
        entries,
        lines,
        undecodable
    );

    if lines == 0 {
        return Err(AnalysisError::LogUnavailable(format!(
            "{} is empty",
            path.display()
        )));
    }
    if entries == 0 {
        return Err(AnalysisError::LogUnavailable(format!(
            "{} is not a structured JSON log",
            path.display()
        )));
    }
    Ok(records)
}

/// Read every parseable access record from `path`
///
/// # Errors
///
/// Returns `AnalysisError::LogUnavailable` when the file is missing, empty or holds no JSON
/// log entries. Lines that are not valid UTF-8 or not records are skipped.
pub fn read_access_log(path: &Path) -> Result<Vec<AccessRecord>, AnalysisError> {
    read_records(path, parse_access_line)
}

/// Read every parseable error record from `path`
pub fn read_error_log(path: &Path) -> Result<Vec<ErrorRecord>, AnalysisError> {
    read_records(path, parse_error_line)
}
