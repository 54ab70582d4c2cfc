use crate::events::{AlertEvent, Severity};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Suppresses repeats of the same (metric, severity) inside a window
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    last_dispatched: HashMap<(String, Severity), DateTime<Utc>>,
}

impl Deduplicator {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::days(1)),
            last_dispatched: HashMap::new(),
        }
    }

    /// Whether `event` repeats one dispatched less than a window before `now`
    pub fn is_duplicate_at(&self, event: &AlertEvent, now: DateTime<Utc>) -> bool {
        self.last_dispatched
            .get(&event.dedup_key())
            .map(|last| now - *last < self.window)
            .unwrap_or(false)
    }

    /// Remember that `event` was dispatched at `now`
    pub fn record_at(&mut self, event: &AlertEvent, now: DateTime<Utc>) {
        let window = self.window;
        self.last_dispatched.retain(|_, last| now - *last < window);
        self.last_dispatched.insert(event.dedup_key(), now);
    }

    pub fn tracked(&self) -> usize {
        self.last_dispatched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(metric: &str, severity: Severity) -> AlertEvent {
        AlertEvent::new("message", severity, metric, "source")
    }

    #[test]
    fn test_repeat_inside_window_is_duplicate() {
        let mut dedup = Deduplicator::new(std::time::Duration::from_secs(300));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cpu = event("cpu_pct", Severity::Warning);

        assert!(!dedup.is_duplicate_at(&cpu, now));
        dedup.record_at(&cpu, now);
        assert!(dedup.is_duplicate_at(&cpu, now + Duration::seconds(299)));
        assert!(!dedup.is_duplicate_at(&cpu, now + Duration::seconds(300)));
    }

    #[test]
    fn test_key_is_metric_and_severity() {
        let mut dedup = Deduplicator::new(std::time::Duration::from_secs(300));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        dedup.record_at(&event("cert_days_left", Severity::Warning), now);

        assert!(!dedup.is_duplicate_at(&event("cert_days_left", Severity::Error), now));
        assert!(!dedup.is_duplicate_at(&event("disk_pct", Severity::Warning), now));
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let mut dedup = Deduplicator::new(std::time::Duration::from_secs(60));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        dedup.record_at(&event("a", Severity::Info), now);
        dedup.record_at(&event("b", Severity::Info), now + Duration::seconds(120));
        assert_eq!(dedup.tracked(), 1);
    }
}
