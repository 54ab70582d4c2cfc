//! The periodic monitor loop
//!
//! One cycle collects observations, evaluates them against the threshold rules and hands
//! the resulting events to the alert dispatcher. Shutdown requests are honoured between
//! cycles; a cycle that has started always runs to completion.

use crate::alerts::{AlertManager, DispatchOutcome};
use crate::analytics::LogAnalyzer;
use crate::collectors::{CollectScope, Collection, CollectorFailure, HealthCollector};
use crate::config::SharedSettings;
use crate::error::CollectorError;
use crate::events::{AlertEvent, Observation, Severity};
use crate::triggers::ThresholdEvaluator;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Metric attached to alerts raised when a collector fails
pub const COLLECTOR_FAILURE_METRIC: &str = "collector_failure";

/// Hours of access log considered by each monitor cycle
const CYCLE_LOG_WINDOW_HOURS: u32 = 1;

/// Cloneable stop signal shared between the signal handler and the loop
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Ask the loop to stop after the current cycle
    pub fn request(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// What one cycle produced
#[derive(Debug, Default)]
pub struct CycleReport {
    pub observations: Vec<Observation>,
    pub events: Vec<AlertEvent>,
    pub outcomes: Vec<DispatchOutcome>,
    /// One entry per collector that failed; the others were still evaluated
    pub collector_errors: Vec<String>,
}

/// Single error alert naming every collector that failed this cycle
fn failure_event(failures: &[CollectorFailure]) -> Option<AlertEvent> {
    if failures.is_empty() {
        return None;
    }
    let details: Vec<String> = failures.iter().map(ToString::to_string).collect();
    Some(AlertEvent::new(
        format!("Health collection failed: {}", details.join("; ")),
        Severity::Error,
        COLLECTOR_FAILURE_METRIC,
        "monitor",
    ))
}

/// Drives collector, evaluator and dispatcher on a fixed interval
pub struct Monitor {
    settings: SharedSettings,
    scope: CollectScope,
    domain: Option<String>,
    collector: HealthCollector,
    analyzer: LogAnalyzer,
    evaluator: ThresholdEvaluator,
    alerts: AlertManager,
}

impl Monitor {
    /// # Arguments
    ///
    /// * `settings` - Shared settings; rules are re-read at the start of every cycle
    /// * `scope` - Which collectors to run
    /// * `domain` - Restrict site and certificate checks to one domain
    /// * `alerts` - Dispatcher for the events each cycle produces
    ///
    /// # Errors
    ///
    /// Returns `CollectorError` if the HTTP client for site probes cannot be built.
    pub fn new(
        settings: SharedSettings,
        scope: CollectScope,
        domain: Option<String>,
        alerts: AlertManager,
    ) -> Result<Self, CollectorError> {
        let (collector, analyzer, evaluator) = {
            let current = settings.read();
            (
                HealthCollector::new(&current)?,
                LogAnalyzer::new(&current.logs),
                ThresholdEvaluator::new(current.alerts.rules.clone()),
            )
        };
        Ok(Self {
            settings,
            scope,
            domain,
            collector,
            analyzer,
            evaluator,
            alerts,
        })
    }

    /// Collect observations for the configured scope
    ///
    /// Access-log statistics are added when enabled and the scope is `All`; an unavailable
    /// log is only logged.
    pub async fn collect(&self) -> Collection {
        let mut collection = self.collector.collect(self.scope, self.domain.as_deref()).await;

        let include_logs = self.settings.read().monitor.include_access_log;
        if include_logs && self.scope == CollectScope::All {
            match self
                .analyzer
                .access_statistics(Utc::now(), CYCLE_LOG_WINDOW_HOURS)
            {
                Ok(report) => collection.observations.extend(report.observations()),
                Err(e) => debug!("Access log statistics skipped: {}", e),
            }
        }
        collection
    }

    /// Evaluate `observations` and dispatch the resulting events
    pub async fn process(&mut self, observations: Vec<Observation>) -> CycleReport {
        self.evaluate_and_dispatch(observations, &[]).await
    }

    async fn evaluate_and_dispatch(
        &mut self,
        observations: Vec<Observation>,
        failures: &[CollectorFailure],
    ) -> CycleReport {
        let mut events = self.evaluator.evaluate(&observations);
        events.extend(failure_event(failures));
        if !events.is_empty() {
            info!("{} alert event(s) this cycle", events.len());
        }
        let outcomes = self.alerts.dispatch_all(&events).await;
        CycleReport {
            observations,
            events,
            outcomes,
            collector_errors: failures.iter().map(ToString::to_string).collect(),
        }
    }

    /// Run one full cycle
    ///
    /// A failing collector is logged and raised as an error alert alongside whatever the
    /// other collectors observed; it never ends the loop.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let rules = self.settings.read().alerts.rules.clone();
        self.evaluator.set_rules(rules);

        let Collection {
            observations,
            failures,
        } = self.collect().await;
        for failure in &failures {
            error!("Collector failed: {}", failure);
        }
        self.evaluate_and_dispatch(observations, &failures).await
    }

    /// Run cycles until `shutdown` is requested; returns the number of completed cycles
    pub async fn run(&mut self, shutdown: &Shutdown) -> u64 {
        let interval = self.settings.read().monitor_interval();
        info!("Monitoring {:?} every {:?}", self.scope, interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = shutdown.subscribe();
        let mut cycles = 0;

        loop {
            if shutdown.is_requested() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown signal dropped");
                    }
                    break;
                }
            }

            let report = self.run_cycle().await;
            cycles += 1;
            debug!(
                "Cycle {} done: {} observation(s), {} event(s)",
                cycles,
                report.observations.len(),
                report.events.len()
            );
        }

        info!("Monitor stopped after {} cycle(s)", cycles);
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::channels::{NotificationTransport, OutboundMessage};
    use crate::config::{ChannelConfig, ChannelKind, Settings};
    use crate::error::AlertError;
    use crate::events::metrics;
    use std::fs;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingTransport {
        posts: Mutex<usize>,
    }

    impl NotificationTransport for CountingTransport {
        fn post<'a>(
            &'a self,
            _message: &'a OutboundMessage,
        ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>> {
            Box::pin(async move {
                *self.posts.lock().unwrap() += 1;
                Ok(())
            })
        }
    }

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.server.config_path = dir.path().join("Caddyfile");
        settings.monitor.cert_dir = dir.path().join("certs");
        settings.monitor.interval_seconds = 1;
        settings.alerts.audit_log = dir.path().join("alerts.log");
        settings.alerts.channels = vec![ChannelConfig {
            kind: ChannelKind::Webhook,
            url: "https://hooks.example.com/x".to_string(),
            chat_id: None,
            format: None,
            enabled: true,
            min_severity: Severity::Info,
        }];
        settings
    }

    fn monitor(settings: Settings, transport: Arc<CountingTransport>) -> Monitor {
        let alerts = AlertManager::new(&settings, transport);
        Monitor::new(SharedSettings::new(settings), CollectScope::Cert, None, alerts).unwrap()
    }

    #[tokio::test]
    async fn test_breaching_observations_are_dispatched_once() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CountingTransport::default());
        let mut monitor = monitor(settings(&dir), transport.clone());
        let batch = vec![
            Observation::new(metrics::DISK_PCT, 97.0, "system"),
            Observation::new(metrics::CPU_PCT, 10.0, "system"),
        ];

        let first = monitor.process(batch.clone()).await;
        let second = monitor.process(batch).await;

        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].severity, Severity::Error);
        assert_eq!(second.outcomes, vec![DispatchOutcome::Suppressed]);
        assert_eq!(*transport.posts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cycle_with_empty_certificate_store() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CountingTransport::default());
        let mut monitor = monitor(settings(&dir), transport.clone());

        let report = monitor.run_cycle().await;

        assert!(report.collector_errors.is_empty());
        assert!(report.observations.is_empty());
        assert_eq!(*transport.posts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_access_log_5xx_responses_raise_an_alert() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.logs.access_log = dir.path().join("access.log");
        let recent = Utc::now().timestamp() - 30;
        let lines: Vec<String> = (0..60)
            .map(|_| {
                format!(
                    r#"{{"level":"info","ts":{},"msg":"handled request","request":{{"remote_ip":"10.0.0.1","method":"GET","uri":"/"}},"duration":0.01,"size":10,"status":502}}"#,
                    recent
                )
            })
            .collect();
        fs::write(&settings.logs.access_log, lines.join("\n")).unwrap();
        let alerts = AlertManager::new(&settings, Arc::new(CountingTransport::default()));
        let mut monitor =
            Monitor::new(SharedSettings::new(settings), CollectScope::All, None, alerts).unwrap();

        let report = monitor.run_cycle().await;

        let count = report
            .observations
            .iter()
            .find(|o| o.metric == metrics::HTTP_5XX_COUNT)
            .unwrap();
        assert_eq!(count.value, 60.0);
        assert!(report
            .events
            .iter()
            .any(|e| e.source_metric == metrics::HTTP_5XX_COUNT && e.severity == Severity::Warning));
    }

    #[tokio::test]
    async fn test_failed_collector_does_not_discard_the_cycle() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        fs::write(&settings.monitor.cert_dir, "not a directory").unwrap();
        let transport = Arc::new(CountingTransport::default());
        let alerts = AlertManager::new(&settings, transport.clone());
        let mut monitor =
            Monitor::new(SharedSettings::new(settings), CollectScope::All, None, alerts).unwrap();

        let report = monitor.run_cycle().await;

        assert_eq!(report.collector_errors.len(), 1);
        assert!(report.collector_errors[0].starts_with("cert: "));
        assert!(report
            .observations
            .iter()
            .any(|o| o.metric == metrics::SERVER_UP));
        assert!(report
            .events
            .iter()
            .any(|e| e.source_metric == COLLECTOR_FAILURE_METRIC && e.severity == Severity::Error));
    }

    #[tokio::test]
    async fn test_rules_are_reloaded_each_cycle() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let shared = SharedSettings::new(settings.clone());
        let alerts = AlertManager::new(&settings, Arc::new(CountingTransport::default()));
        let mut monitor = Monitor::new(shared.clone(), CollectScope::Cert, None, alerts).unwrap();

        shared.update(|s| s.alerts.rules.clear());
        monitor.run_cycle().await;
        let report = monitor
            .process(vec![Observation::new(metrics::DISK_PCT, 99.0, "system")])
            .await;

        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_stopped() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(settings(&dir), Arc::new(CountingTransport::default()));
        let shutdown = Shutdown::new();
        shutdown.request();

        assert_eq!(monitor.run(&shutdown).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_observed_between_cycles() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(settings(&dir), Arc::new(CountingTransport::default()));
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.request();
        });

        let cycles = monitor.run(&shutdown).await;
        assert_eq!(cycles, 3);
    }
}
