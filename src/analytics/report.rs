//! Statistics over a window of log records
//!
//! Every function here is pure: the current time and the records are inputs, so reports are
//! reproducible in tests.

use crate::events::{metrics, AccessRecord, ErrorRecord, Observation, Timestamp};
use chrono::{Duration as ChronoDuration, Timelike};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

/// Entries in every top-N list
pub const TOP_N: usize = 10;

/// Entries in the recent slow-request and error lists
pub const RECENT_N: usize = 10;

/// Source label of observations derived from the access log
pub const ACCESS_LOG_SOURCE: &str = "access-log";

/// A value and how often it occurred
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficReport {
    pub total_requests: u64,
    pub unique_ips: u64,
    pub status_counts: BTreeMap<u16, u64>,
    pub top_ips: Vec<Ranked>,
    pub top_paths: Vec<Ranked>,
    pub top_user_agents: Vec<Ranked>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Throughput {
    pub total_bytes: u64,
    pub avg_request_bytes: f64,
    pub bandwidth_bytes_per_sec: f64,
    pub requests_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub latency: LatencyStats,
    pub throughput: Throughput,
    /// Requests per hour of day, index 0 is 00:00-00:59
    pub requests_by_hour: Vec<u64>,
    pub slow_threshold_ms: f64,
    pub slow_request_count: u64,
    /// Most recent slow requests, newest first
    pub slow_requests: Vec<AccessRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub total_errors: u64,
    pub client_errors: BTreeMap<u16, u64>,
    pub server_errors: BTreeMap<u16, u64>,
    pub top_paths: Vec<Ranked>,
    pub top_ips: Vec<Ranked>,
    pub errors_by_hour: Vec<u64>,
    /// Most recent raw error lines, newest first
    pub recent: Vec<String>,
}

/// Everything `analyze` can report; sections not requested or unavailable are `None`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogReport {
    pub generated_at: Timestamp,
    pub window_hours: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorReport>,
}

impl LogReport {
    pub fn new(generated_at: Timestamp, window_hours: u32) -> Self {
        Self {
            generated_at,
            window_hours,
            traffic: None,
            performance: None,
            errors: None,
        }
    }

    /// Observations the monitor loop evaluates against threshold rules
    pub fn observations(&self) -> Vec<Observation> {
        let mut observations = Vec::new();
        if let Some(traffic) = &self.traffic {
            let count_class = |class: u16| -> u64 {
                traffic
                    .status_counts
                    .iter()
                    .filter(|(status, _)| **status / 100 == class)
                    .map(|(_, count)| count)
                    .sum()
            };
            observations.push(Observation::new(
                metrics::HTTP_4XX_COUNT,
                count_class(4) as f64,
                ACCESS_LOG_SOURCE,
            ));
            observations.push(Observation::new(
                metrics::HTTP_5XX_COUNT,
                count_class(5) as f64,
                ACCESS_LOG_SOURCE,
            ));
        }
        if let Some(performance) = &self.performance {
            observations.push(Observation::new(
                metrics::LATENCY_P95_MS,
                performance.latency.p95_ms,
                ACCESS_LOG_SOURCE,
            ));
            observations.push(Observation::new(
                metrics::SLOW_REQUEST_COUNT,
                performance.slow_request_count as f64,
                ACCESS_LOG_SOURCE,
            ));
        }
        observations
    }
}

/// Records inside the last `hours` hours before `now`
pub fn within_window<'a, T, F>(records: &'a [T], now: Timestamp, hours: u32, timestamp: F) -> Vec<&'a T>
where
    F: Fn(&T) -> Timestamp,
{
    let cutoff = now - ChronoDuration::hours(i64::from(hours));
    records
        .iter()
        .filter(|record| {
            let ts = timestamp(record);
            ts >= cutoff && ts <= now
        })
        .collect()
}

/// Value at index `floor(n * p)` of an ascending slice, clamped to the last element
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn top_n<K, I>(values: I, n: usize) -> Vec<Ranked>
where
    K: Eq + Hash + Ord + ToString,
    I: IntoIterator<Item = K>,
{
    let mut counts: HashMap<K, u64> = HashMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut ranked: Vec<(K, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(n)
        .map(|(value, count)| Ranked {
            value: value.to_string(),
            count,
        })
        .collect()
}

fn by_hour<I: IntoIterator<Item = Timestamp>>(timestamps: I) -> Vec<u64> {
    let mut buckets = vec![0u64; 24];
    for ts in timestamps {
        buckets[ts.hour() as usize] += 1;
    }
    buckets
}

pub fn traffic_report(records: &[&AccessRecord]) -> TrafficReport {
    let unique: HashSet<&str> = records.iter().map(|r| r.client_ip.as_str()).collect();
    let mut status_counts = BTreeMap::new();
    for record in records {
        *status_counts.entry(record.status).or_insert(0) += 1;
    }
    TrafficReport {
        total_requests: records.len() as u64,
        unique_ips: unique.len() as u64,
        status_counts,
        top_ips: top_n(records.iter().map(|r| r.client_ip.as_str()), TOP_N),
        top_paths: top_n(records.iter().map(|r| r.path.as_str()), TOP_N),
        top_user_agents: top_n(
            records
                .iter()
                .filter(|r| !r.user_agent.is_empty())
                .map(|r| r.user_agent.as_str()),
            TOP_N,
        ),
    }
}

pub fn latency_stats(records: &[&AccessRecord]) -> LatencyStats {
    let mut latencies: Vec<f64> = records.iter().map(|r| r.latency_ms).collect();
    latencies.sort_by(|a, b| a.total_cmp(b));
    let mean_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };
    LatencyStats {
        mean_ms,
        p50_ms: percentile(&latencies, 0.50),
        p75_ms: percentile(&latencies, 0.75),
        p90_ms: percentile(&latencies, 0.90),
        p95_ms: percentile(&latencies, 0.95),
        p99_ms: percentile(&latencies, 0.99),
    }
}

/// # Arguments
///
/// * `window_hours` - Window length the bandwidth and request rate are averaged over
/// * `slow_threshold_ms` - Requests slower than this are reported as slow
pub fn performance_report(
    records: &[&AccessRecord],
    window_hours: u32,
    slow_threshold_ms: f64,
) -> PerformanceReport {
    let total_bytes: u64 = records.iter().map(|r| r.bytes_sent).sum();
    let window_secs = f64::from(window_hours.max(1)) * 3600.0;
    let avg_request_bytes = if records.is_empty() {
        0.0
    } else {
        total_bytes as f64 / records.len() as f64
    };

    let mut slow: Vec<&AccessRecord> = records
        .iter()
        .copied()
        .filter(|r| r.latency_ms > slow_threshold_ms)
        .collect();
    let slow_request_count = slow.len() as u64;
    slow.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    PerformanceReport {
        latency: latency_stats(records),
        throughput: Throughput {
            total_bytes,
            avg_request_bytes,
            bandwidth_bytes_per_sec: total_bytes as f64 / window_secs,
            requests_per_sec: records.len() as f64 / window_secs,
        },
        requests_by_hour: by_hour(records.iter().map(|r| r.timestamp)),
        slow_threshold_ms,
        slow_request_count,
        slow_requests: slow.into_iter().take(RECENT_N).cloned().collect(),
    }
}

pub fn error_report(records: &[&ErrorRecord]) -> ErrorReport {
    let mut client_errors = BTreeMap::new();
    let mut server_errors = BTreeMap::new();
    for record in records {
        match record.status {
            400..=499 => *client_errors.entry(record.status).or_insert(0) += 1,
            500..=599 => *server_errors.entry(record.status).or_insert(0) += 1,
            _ => {}
        }
    }

    let mut newest: Vec<&ErrorRecord> = records.to_vec();
    newest.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    ErrorReport {
        total_errors: records.len() as u64,
        client_errors,
        server_errors,
        top_paths: top_n(
            records.iter().filter(|r| !r.path.is_empty()).map(|r| r.path.as_str()),
            TOP_N,
        ),
        top_ips: top_n(
            records
                .iter()
                .filter(|r| !r.client_ip.is_empty())
                .map(|r| r.client_ip.as_str()),
            TOP_N,
        ),
        errors_by_hour: by_hour(records.iter().map(|r| r.timestamp)),
        recent: newest.into_iter().take(RECENT_N).map(|r| r.raw.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn access(minutes_ago: i64, ip: &str, path: &str, status: u16, latency_ms: f64) -> AccessRecord {
        AccessRecord {
            client_ip: ip.to_string(),
            timestamp: now() - ChronoDuration::minutes(minutes_ago),
            method: "GET".to_string(),
            path: path.to_string(),
            status,
            bytes_sent: 1000,
            latency_ms,
            user_agent: "test-agent".to_string(),
        }
    }

    fn error(minutes_ago: i64, status: u16, path: &str) -> ErrorRecord {
        ErrorRecord {
            timestamp: now() - ChronoDuration::minutes(minutes_ago),
            status,
            path: path.to_string(),
            client_ip: "198.51.100.7".to_string(),
            message: "upstream error".to_string(),
            raw: format!("{{\"status\":{},\"minutes_ago\":{}}}", status, minutes_ago),
        }
    }

    #[test]
    fn test_percentiles_over_one_hundred_requests() {
        let records: Vec<AccessRecord> = (1..=100)
            .map(|i| access(i, "10.0.0.1", "/", 200, i as f64))
            .collect();
        let refs: Vec<&AccessRecord> = records.iter().collect();

        let stats = latency_stats(&refs);

        assert_eq!(stats.p50_ms, 51.0);
        assert_eq!(stats.p75_ms, 76.0);
        assert_eq!(stats.p90_ms, 91.0);
        assert_eq!(stats.p95_ms, 96.0);
        assert_eq!(stats.p99_ms, 100.0);
        assert!((stats.mean_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
        assert_eq!(percentile(&[1.0, 2.0], 1.0), 2.0);
    }

    #[test]
    fn test_window_filters_old_records() {
        let records = vec![
            access(30, "a", "/", 200, 1.0),
            access(90, "b", "/", 200, 1.0),
            access(60 * 25, "c", "/", 200, 1.0),
        ];
        assert_eq!(within_window(&records, now(), 1, |r| r.timestamp).len(), 1);
        assert_eq!(within_window(&records, now(), 24, |r| r.timestamp).len(), 2);
    }

    #[test]
    fn test_traffic_report_counts() {
        let records = vec![
            access(1, "10.0.0.1", "/a", 200, 1.0),
            access(2, "10.0.0.1", "/a", 200, 1.0),
            access(3, "10.0.0.2", "/b", 404, 1.0),
            access(4, "10.0.0.3", "/a", 502, 1.0),
        ];
        let refs: Vec<&AccessRecord> = records.iter().collect();

        let report = traffic_report(&refs);

        assert_eq!(report.total_requests, 4);
        assert_eq!(report.unique_ips, 3);
        assert_eq!(report.status_counts.get(&200), Some(&2));
        assert_eq!(report.top_ips[0], Ranked { value: "10.0.0.1".to_string(), count: 2 });
        assert_eq!(report.top_paths[0], Ranked { value: "/a".to_string(), count: 3 });
        assert_eq!(report.top_user_agents[0].count, 4);
    }

    #[test]
    fn test_top_n_is_capped_and_tie_broken() {
        let values: Vec<String> = (0..15).map(|i| format!("v{:02}", i)).collect();
        let ranked = top_n(values.iter().map(String::as_str), TOP_N);
        assert_eq!(ranked.len(), TOP_N);
        assert_eq!(ranked[0].value, "v00");
    }

    #[test]
    fn test_performance_report() {
        let records = vec![
            access(1, "a", "/fast", 200, 10.0),
            access(2, "a", "/slow", 200, 2500.0),
            access(3, "a", "/slower", 200, 4000.0),
            access(4, "a", "/edge", 200, 2000.0),
        ];
        let refs: Vec<&AccessRecord> = records.iter().collect();

        let report = performance_report(&refs, 1, 2000.0);

        assert_eq!(report.slow_request_count, 2);
        assert_eq!(report.slow_requests[0].path, "/slow");
        assert_eq!(report.throughput.total_bytes, 4000);
        assert_eq!(report.throughput.avg_request_bytes, 1000.0);
        assert!((report.throughput.bandwidth_bytes_per_sec - 4000.0 / 3600.0).abs() < 1e-9);
        assert_eq!(report.requests_by_hour[11], 4);
        assert_eq!(report.requests_by_hour.iter().sum::<u64>(), 4);
    }

    #[test]
    fn test_error_report() {
        let records = vec![
            error(5, 502, "/checkout"),
            error(10, 502, "/checkout"),
            error(15, 404, "/missing"),
            error(20, 0, ""),
        ];
        let refs: Vec<&ErrorRecord> = records.iter().collect();

        let report = error_report(&refs);

        assert_eq!(report.total_errors, 4);
        assert_eq!(report.server_errors.get(&502), Some(&2));
        assert_eq!(report.client_errors.get(&404), Some(&1));
        assert_eq!(report.top_paths[0].value, "/checkout");
        assert_eq!(report.recent[0], records[0].raw);
        assert_eq!(report.errors_by_hour[11], 4);
    }

    #[test]
    fn test_observations_from_report() {
        let records = vec![
            access(1, "a", "/", 500, 10.0),
            access(2, "a", "/", 503, 3000.0),
            access(3, "a", "/", 404, 10.0),
        ];
        let refs: Vec<&AccessRecord> = records.iter().collect();
        let mut report = LogReport::new(now(), 1);
        report.traffic = Some(traffic_report(&refs));
        report.performance = Some(performance_report(&refs, 1, 2000.0));

        let observations = report.observations();
        let value = |metric: &str| observations.iter().find(|o| o.metric == metric).unwrap().value;

        assert_eq!(value(metrics::HTTP_5XX_COUNT), 2.0);
        assert_eq!(value(metrics::HTTP_4XX_COUNT), 1.0);
        assert_eq!(value(metrics::SLOW_REQUEST_COUNT), 1.0);
        assert!(observations.iter().all(|o| o.source == ACCESS_LOG_SOURCE));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_percentile_is_an_element(values: Vec<u16>, p: u8) -> bool {
        let mut sorted: Vec<f64> = values.into_iter().map(f64::from).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p = f64::from(p) / 255.0;
        let result = percentile(&sorted, p);
        if sorted.is_empty() {
            result == 0.0
        } else {
            sorted.contains(&result)
        }
    }

    #[quickcheck]
    fn prop_percentile_is_monotonic(values: Vec<u16>, a: u8, b: u8) -> bool {
        let mut sorted: Vec<f64> = values.into_iter().map(f64::from).collect();
        sorted.sort_by(|x, y| x.total_cmp(y));
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        percentile(&sorted, f64::from(low) / 255.0) <= percentile(&sorted, f64::from(high) / 255.0)
    }
}
