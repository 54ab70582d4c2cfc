//! Core event types shared by the collectors, analytics engine and alert pipeline
//!
//! Observations flow from the collectors into the threshold evaluator, which turns
//! them into alert events. Log records are the read-only input of the analytics engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Well-known metric names produced by the collectors and the analytics engine
pub mod metrics {
    pub const CPU_PCT: &str = "cpu_pct";
    pub const MEM_PCT: &str = "mem_pct";
    pub const DISK_PCT: &str = "disk_pct";
    pub const SERVER_UP: &str = "server_up";
    pub const SITE_UP: &str = "site_up";
    pub const SITE_STATUS: &str = "site_status";
    pub const SITE_LATENCY_MS: &str = "site_latency_ms";
    pub const CERT_DAYS_LEFT: &str = "cert_days_left";
    pub const CERT_WEAK_SIGNATURE: &str = "cert_weak_signature";
    pub const CERT_SHORT_KEY: &str = "cert_short_key";
    pub const HTTP_4XX_COUNT: &str = "http_4xx_count";
    pub const HTTP_5XX_COUNT: &str = "http_5xx_count";
    pub const LATENCY_P95_MS: &str = "latency_p95_ms";
    pub const SLOW_REQUEST_COUNT: &str = "slow_request_count";
    /// Prefix for TCP connection counts, e.g. `tcp_established`
    pub const TCP_PREFIX: &str = "tcp_";
}

/// Severity level attached to alert events and threshold rules
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, no action required
    Info,
    /// Something may require attention
    Warning,
    /// Something is broken
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One timestamped metric sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub timestamp: Timestamp,
    /// Metric name, see [`metrics`]
    pub metric: String,
    pub value: f64,
    /// Where the sample came from: `system`, a domain, a certificate, `access-log`
    pub source: String,
}

impl Observation {
    pub fn new(metric: impl Into<String>, value: f64, source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            metric: metric.into(),
            value,
            source: source.into(),
        }
    }
}

/// An alert produced by the threshold evaluator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub message: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
    /// Metric whose rule fired; part of the dedup key
    pub source_metric: String,
    /// Observation source the rule fired for
    pub source: String,
}

impl AlertEvent {
    pub fn new(
        message: impl Into<String>,
        severity: Severity,
        source_metric: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            source_metric: source_metric.into(),
            source: source.into(),
        }
    }

    /// Key under which identical events are deduplicated
    ///
    /// The key is the metric and severity only. Two sources breaching the same rule inside
    /// one suppression window produce a single dispatch, carrying the first source's message;
    /// the second event is recorded in the audit log as suppressed.
    pub fn dedup_key(&self) -> (String, Severity) {
        (self.source_metric.clone(), self.severity)
    }
}

/// A single request from the access log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRecord {
    pub client_ip: String,
    pub timestamp: Timestamp,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub bytes_sent: u64,
    pub latency_ms: f64,
    pub user_agent: String,
}

/// A single entry from the error log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub timestamp: Timestamp,
    pub status: u16,
    pub path: String,
    pub client_ip: String,
    pub message: String,
    /// The line as it appeared in the log
    pub raw: String,
}
