/// Caddy JSON log line parsing
pub mod log_parser;

/// Text and JSON output
pub mod render;

/// Pure statistics over log records
pub mod report;

use crate::config::LogSettings;
use crate::error::AnalysisError;
use crate::events::{AccessRecord, ErrorRecord, Timestamp};
use log::info;
use std::path::PathBuf;

pub use render::{render_json, render_text};
pub use report::LogReport;

/// Which sections an analysis produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Access,
    Error,
    Performance,
    All,
}

/// Build a report from already-loaded records
///
/// Records outside the window are ignored. A section whose records are `None` is left out.
pub fn build_report(
    kind: ReportKind,
    now: Timestamp,
    hours: u32,
    access: Option<&[AccessRecord]>,
    errors: Option<&[ErrorRecord]>,
    slow_threshold_ms: f64,
) -> LogReport {
    let mut report = LogReport::new(now, hours);

    if let Some(access) = access {
        let recent = report::within_window(access, now, hours, |r| r.timestamp);
        if matches!(kind, ReportKind::Access | ReportKind::All) {
            report.traffic = Some(report::traffic_report(&recent));
        }
        if matches!(kind, ReportKind::Performance | ReportKind::All) {
            report.performance = Some(report::performance_report(&recent, hours, slow_threshold_ms));
        }
    }
    if let Some(errors) = errors {
        if matches!(kind, ReportKind::Error | ReportKind::All) {
            let recent = report::within_window(errors, now, hours, |r| r.timestamp);
            report.errors = Some(report::error_report(&recent));
        }
    }
    report
}

/// Loads the configured logs and reports on them
pub struct LogAnalyzer {
    access_log: PathBuf,
    error_log: PathBuf,
    slow_request_ms: f64,
}

impl LogAnalyzer {
    pub fn new(settings: &LogSettings) -> Self {
        Self {
            access_log: settings.access_log.clone(),
            error_log: settings.error_log.clone(),
            slow_request_ms: settings.slow_request_ms,
        }
    }

    /// Analyze the last `hours` hours of logs
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::LogUnavailable` when a log the report needs is missing or
    /// holds no parseable records; `ReportKind::All` needs both logs. No partial report is
    /// produced.
    pub fn analyze(&self, kind: ReportKind, now: Timestamp, hours: u32) -> Result<LogReport, AnalysisError> {
        let access = match kind {
            ReportKind::Access | ReportKind::Performance | ReportKind::All => {
                Some(log_parser::read_access_log(&self.access_log)?)
            }
            ReportKind::Error => None,
        };
        let errors = match kind {
            ReportKind::Error | ReportKind::All => Some(log_parser::read_error_log(&self.error_log)?),
            ReportKind::Access | ReportKind::Performance => None,
        };

        info!(
            "Analyzing {} access and {} error record(s) over {} hour(s)",
            access.as_ref().map(Vec::len).unwrap_or(0),
            errors.as_ref().map(Vec::len).unwrap_or(0),
            hours
        );
        Ok(build_report(
            kind,
            now,
            hours,
            access.as_deref(),
            errors.as_deref(),
            self.slow_request_ms,
        ))
    }

    /// Traffic and performance sections over the access log alone
    ///
    /// This is what each monitor cycle evaluates; the error log is not read.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::LogUnavailable` when the access log is missing or empty.
    pub fn access_statistics(&self, now: Timestamp, hours: u32) -> Result<LogReport, AnalysisError> {
        let access = log_parser::read_access_log(&self.access_log)?;
        Ok(build_report(
            ReportKind::All,
            now,
            hours,
            Some(&access),
            None,
            self.slow_request_ms,
        ))
    }
}
