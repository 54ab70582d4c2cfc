use crate::error::AlertError;
use crate::events::{AlertEvent, Severity, Timestamp};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// What happened to a dispatched alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Delivered,
    PartiallyDelivered,
    Failed,
    NoChannels,
    Suppressed,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFailure {
    pub channel: String,
    pub error: String,
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub recorded_at: Timestamp,
    pub event_time: Timestamp,
    pub severity: Severity,
    pub metric: String,
    pub source: String,
    pub message: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub delivered: Vec<String>,
    #[serde(default)]
    pub failed: Vec<ChannelFailure>,
}

/// Append-only JSON-lines record of every dispatch
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Audit trail that only logs
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Log the dispatch at the event's own severity and append it to the file
    ///
    /// A write failure is logged and otherwise ignored.
    pub fn record(&self, event: &AlertEvent, entry: &AuditEntry) {
        let line = format!(
            "[{}] {} ({:?}): {}",
            event.source_metric, event.source, entry.outcome, event.message
        );
        match event.severity {
            Severity::Info => info!("{}", line),
            Severity::Warning => warn!("{}", line),
            Severity::Error => error!("{}", line),
        }

        if let Err(e) = self.append(entry) {
            warn!("Failed to write alert audit log: {}", e);
        }
    }

    fn append(&self, entry: &AuditEntry) -> Result<(), AlertError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

impl AuditEntry {
    pub fn new(event: &AlertEvent, outcome: AuditOutcome, recorded_at: Timestamp) -> Self {
        Self {
            recorded_at,
            event_time: event.timestamp,
            severity: event.severity,
            metric: event.source_metric.clone(),
            source: event.source.clone(),
            message: event.message.clone(),
            outcome,
            delivered: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_entries_are_appended_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/alerts.log");
        let audit = AuditLog::new(&path);
        let event = AlertEvent::new("disk full", Severity::Error, "disk_pct", "system");

        let mut delivered = AuditEntry::new(&event, AuditOutcome::Delivered, Utc::now());
        delivered.delivered.push("slack".to_string());
        audit.record(&event, &delivered);
        audit.record(&event, &AuditEntry::new(&event, AuditOutcome::Suppressed, Utc::now()));

        let content = fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].delivered, vec!["slack"]);
        assert_eq!(entries[1].outcome, AuditOutcome::Suppressed);
        assert!(content.contains("\"outcome\":\"suppressed\""));
    }

    #[test]
    fn test_unwritable_log_does_not_panic() {
        let audit = AuditLog::new("/proc/caddy-warden/alerts.log");
        let event = AlertEvent::new("x", Severity::Info, "m", "s");
        audit.record(&event, &AuditEntry::new(&event, AuditOutcome::Failed, Utc::now()));
    }
}
