use super::report::{ErrorReport, LogReport, PerformanceReport, Ranked, TrafficReport};
use std::collections::BTreeMap;
use std::fmt::Write;

const RULE: &str = "----------------------------------------";

/// Plain-text rendering of a report for the terminal
pub fn render_text(report: &LogReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Log analysis for the last {} hour(s), generated {}",
        report.window_hours,
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(traffic) = &report.traffic {
        render_traffic(&mut out, traffic);
    }
    if let Some(performance) = &report.performance {
        render_performance(&mut out, performance);
    }
    if let Some(errors) = &report.errors {
        render_errors(&mut out, errors);
    }
    out
}

/// Pretty-printed JSON rendering
pub fn render_json(report: &LogReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

fn heading(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{}\n{}\n{}", RULE, title, RULE);
}

fn ranked(out: &mut String, title: &str, entries: &[Ranked]) {
    let _ = writeln!(out, "{}:", title);
    if entries.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for entry in entries {
        let _ = writeln!(out, "  {:>8}  {}", entry.count, entry.value);
    }
}

fn histogram(out: &mut String, title: &str, counts: &BTreeMap<u16, u64>) {
    let _ = writeln!(out, "{}:", title);
    if counts.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (status, count) in counts {
        let _ = writeln!(out, "  {:>8}  {}", count, status);
    }
}

fn hours(out: &mut String, title: &str, buckets: &[u64]) {
    let _ = writeln!(out, "{}:", title);
    for (hour, count) in buckets.iter().enumerate().filter(|(_, c)| **c > 0) {
        let _ = writeln!(out, "  {:02}:00  {}", hour, count);
    }
}

fn render_traffic(out: &mut String, traffic: &TrafficReport) {
    heading(out, "Traffic");
    let _ = writeln!(out, "Total requests: {}", traffic.total_requests);
    let _ = writeln!(out, "Unique client IPs: {}", traffic.unique_ips);
    histogram(out, "Status codes", &traffic.status_counts);
    ranked(out, "Top client IPs", &traffic.top_ips);
    ranked(out, "Top paths", &traffic.top_paths);
    ranked(out, "Top user agents", &traffic.top_user_agents);
}

fn render_performance(out: &mut String, performance: &PerformanceReport) {
    heading(out, "Performance");
    let latency = &performance.latency;
    let _ = writeln!(out, "Latency mean: {:.1} ms", latency.mean_ms);
    let _ = writeln!(
        out,
        "Latency P50/P75/P90/P95/P99: {:.1} / {:.1} / {:.1} / {:.1} / {:.1} ms",
        latency.p50_ms, latency.p75_ms, latency.p90_ms, latency.p95_ms, latency.p99_ms
    );
    let throughput = &performance.throughput;
    let _ = writeln!(out, "Bytes sent: {}", throughput.total_bytes);
    let _ = writeln!(out, "Average response size: {:.0} bytes", throughput.avg_request_bytes);
    let _ = writeln!(out, "Average bandwidth: {:.1} bytes/s", throughput.bandwidth_bytes_per_sec);
    let _ = writeln!(out, "Requests per second: {:.3}", throughput.requests_per_sec);
    hours(out, "Requests by hour", &performance.requests_by_hour);
    let _ = writeln!(
        out,
        "Slow requests (> {:.0} ms): {}",
        performance.slow_threshold_ms, performance.slow_request_count
    );
    for record in &performance.slow_requests {
        let _ = writeln!(
            out,
            "  {}  {:>8.0} ms  {} {} ({})",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.latency_ms,
            record.method,
            record.path,
            record.status
        );
    }
}

fn render_errors(out: &mut String, errors: &ErrorReport) {
    heading(out, "Errors");
    let _ = writeln!(out, "Total errors: {}", errors.total_errors);
    histogram(out, "Client errors (4xx)", &errors.client_errors);
    histogram(out, "Server errors (5xx)", &errors.server_errors);
    ranked(out, "Top failing paths", &errors.top_paths);
    ranked(out, "Top offending IPs", &errors.top_ips);
    hours(out, "Errors by hour", &errors.errors_by_hour);
    let _ = writeln!(out, "Most recent errors:");
    for line in &errors.recent {
        let _ = writeln!(out, "  {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::report::{error_report, performance_report, traffic_report};
    use crate::events::{AccessRecord, ErrorRecord};
    use chrono::{TimeZone, Utc};

    fn report() -> LogReport {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let access = vec![AccessRecord {
            client_ip: "203.0.113.9".to_string(),
            timestamp: now,
            method: "GET".to_string(),
            path: "/slow".to_string(),
            status: 200,
            bytes_sent: 512,
            latency_ms: 2500.0,
            user_agent: "curl/8.4.0".to_string(),
        }];
        let errors = vec![ErrorRecord {
            timestamp: now,
            status: 502,
            path: "/checkout".to_string(),
            client_ip: "198.51.100.7".to_string(),
            message: "bad gateway".to_string(),
            raw: "{\"status\":502}".to_string(),
        }];
        let access_refs: Vec<&AccessRecord> = access.iter().collect();
        let error_refs: Vec<&ErrorRecord> = errors.iter().collect();
        let mut report = LogReport::new(now, 24);
        report.traffic = Some(traffic_report(&access_refs));
        report.performance = Some(performance_report(&access_refs, 24, 2000.0));
        report.errors = Some(error_report(&error_refs));
        report
    }

    #[test]
    fn test_text_contains_every_section() {
        let text = render_text(&report());
        assert!(text.contains("last 24 hour(s)"));
        assert!(text.contains("Total requests: 1"));
        assert!(text.contains("Slow requests (> 2000 ms): 1"));
        assert!(text.contains("GET /slow (200)"));
        assert!(text.contains("Server errors (5xx)"));
        assert!(text.contains("12:00  1"));
    }

    #[test]
    fn test_json_is_machine_readable() {
        let json = render_json(&report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["traffic"]["total_requests"], 1);
        assert_eq!(value["errors"]["server_errors"]["502"], 1);
        assert_eq!(value["performance"]["slow_request_count"], 1);
    }

    #[test]
    fn test_missing_sections_are_omitted() {
        let mut report = report();
        report.errors = None;
        assert!(!render_text(&report).contains("Errors"));
        let value: serde_json::Value = serde_json::from_str(&render_json(&report).unwrap()).unwrap();
        assert!(value.get("errors").is_none());
    }
}
