use super::audit::{AuditEntry, AuditLog, AuditOutcome, ChannelFailure};
use super::channels::{render, NotificationTransport};
use super::dedup::Deduplicator;
use super::rate_limiter::RateLimiter;
use crate::config::{ChannelConfig, Settings};
use crate::events::{AlertEvent, Severity, Timestamp};
use crate::retry::RetryPolicy;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Metric name of the alert sent by `test-alert`
pub const TEST_ALERT_METRIC: &str = "test_alert";

/// What `dispatch` did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Alerting is switched off
    Disabled,
    /// Same metric and severity went out within the suppression window
    Suppressed,
    /// The global per-minute cap was reached
    RateLimited,
    /// No enabled channel accepts this severity
    NoChannels,
    Sent {
        delivered: Vec<String>,
        failed: Vec<ChannelFailure>,
    },
}

impl DispatchOutcome {
    /// At least one channel was attempted and none succeeded
    pub fn all_failed(&self) -> bool {
        matches!(self, DispatchOutcome::Sent { delivered, failed } if delivered.is_empty() && !failed.is_empty())
    }
}

/// Fans alert events out to the configured channels
///
/// Each event passes the dedup window and the global rate limit, then goes to every
/// eligible channel concurrently, each channel with its own retries. Every dispatch is
/// written to the audit log whatever its outcome.
pub struct AlertManager {
    enabled: bool,
    channels: Vec<ChannelConfig>,
    transport: Arc<dyn NotificationTransport>,
    retry: RetryPolicy,
    dedup: Deduplicator,
    limiter: RateLimiter,
    audit: AuditLog,
}

impl AlertManager {
    /// # Arguments
    ///
    /// * `settings` - Alert settings plus the monitor interval used as the default dedup window
    /// * `transport` - Delivery mechanism shared by every channel
    pub fn new(settings: &Settings, transport: Arc<dyn NotificationTransport>) -> Self {
        let alerts = &settings.alerts;
        Self {
            enabled: alerts.enabled,
            channels: alerts.channels.clone(),
            transport,
            retry: RetryPolicy::new(
                alerts.retry_attempts,
                Duration::from_secs(alerts.retry_interval_seconds),
            ),
            dedup: Deduplicator::new(settings.suppression_window()),
            limiter: RateLimiter::new(alerts.rate_limit_per_minute),
            audit: AuditLog::new(alerts.audit_log.clone()),
        }
    }

    /// Replace the audit trail
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.iter().filter(|c| c.enabled).count()
    }

    /// Dispatch one event now
    pub async fn dispatch(&mut self, event: &AlertEvent) -> DispatchOutcome {
        self.dispatch_at(event, Utc::now()).await
    }

    /// Dispatch every event in order
    pub async fn dispatch_all(&mut self, events: &[AlertEvent]) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.dispatch(event).await);
        }
        outcomes
    }

    /// Dispatch `event` as if the current time were `now`
    pub async fn dispatch_at(&mut self, event: &AlertEvent, now: Timestamp) -> DispatchOutcome {
        if !self.enabled {
            debug!("Alerting disabled, dropping: {}", event.message);
            return DispatchOutcome::Disabled;
        }

        if self.dedup.is_duplicate_at(event, now) {
            debug!("Suppressed duplicate {} {}", event.source_metric, event.severity);
            self.audit
                .record(event, &AuditEntry::new(event, AuditOutcome::Suppressed, now));
            return DispatchOutcome::Suppressed;
        }

        if !self.limiter.try_acquire_at(now) {
            warn!("Alert rate limit reached, dropping: {}", event.message);
            self.audit
                .record(event, &AuditEntry::new(event, AuditOutcome::RateLimited, now));
            return DispatchOutcome::RateLimited;
        }

        self.dedup.record_at(event, now);
        self.send(event, now).await
    }

    /// Send a test alert to every enabled channel, bypassing dedup and the rate limit
    pub async fn send_test(&mut self, message: &str) -> DispatchOutcome {
        if !self.enabled {
            return DispatchOutcome::Disabled;
        }
        let event = AlertEvent::new(message, Severity::Info, TEST_ALERT_METRIC, "caddy-warden");
        self.send(&event, Utc::now()).await
    }

    async fn send(&self, event: &AlertEvent, now: Timestamp) -> DispatchOutcome {
        let (delivered, failed) = self.deliver(event).await;
        let outcome = match (delivered.is_empty(), failed.is_empty()) {
            (true, true) => AuditOutcome::NoChannels,
            (false, true) => AuditOutcome::Delivered,
            (true, false) => AuditOutcome::Failed,
            (false, false) => AuditOutcome::PartiallyDelivered,
        };

        let mut entry = AuditEntry::new(event, outcome, now);
        entry.delivered = delivered.clone();
        entry.failed = failed.clone();
        self.audit.record(event, &entry);

        if outcome == AuditOutcome::NoChannels {
            DispatchOutcome::NoChannels
        } else {
            DispatchOutcome::Sent { delivered, failed }
        }
    }

    async fn deliver(&self, event: &AlertEvent) -> (Vec<String>, Vec<ChannelFailure>) {
        let eligible = self
            .channels
            .iter()
            .filter(|c| c.enabled && event.severity >= c.min_severity);

        let mut handles = Vec::new();
        for channel in eligible {
            let message = render(channel, event);
            let transport = Arc::clone(&self.transport);
            let retry = self.retry;
            let name = message.channel;
            let handle = tokio::spawn(async move {
                retry
                    .execute(|_| transport.post(&message))
                    .await
                    .map_err(|failure| failure.to_string())
            });
            handles.push((name, handle));
        }

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {
                    info!("Alert delivered via {}", name);
                    delivered.push(name.to_string());
                }
                Ok(Err(error)) => {
                    warn!("Alert delivery via {} failed: {}", name, error);
                    failed.push(ChannelFailure {
                        channel: name.to_string(),
                        error,
                    });
                }
                Err(e) => failed.push(ChannelFailure {
                    channel: name.to_string(),
                    error: format!("delivery task failed: {}", e),
                }),
            }
        }
        (delivered, failed)
    }
}
