use crate::events::{metrics, AlertEvent, Observation};
use crate::triggers::rules::ThresholdRule;
use log::debug;

/// Turns a batch of observations into alert events using the active rule set
pub struct ThresholdEvaluator {
    rules: Vec<ThresholdRule>,
}

impl ThresholdEvaluator {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    /// Replace the active rule set
    pub fn set_rules(&mut self, rules: Vec<ThresholdRule>) {
        self.rules = rules;
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every observation against the rules
    ///
    /// Several rules may fire in one batch. When more than one rule on the same metric
    /// fires for a single observation, only the most severe produces an event.
    pub fn evaluate(&self, observations: &[Observation]) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for observation in observations {
            let strongest = self
                .rules
                .iter()
                .filter(|rule| rule.fires(observation))
                .max_by_key(|rule| rule.severity);

            if let Some(rule) = strongest {
                debug!(
                    "Rule {} {} {} fired for {} = {}",
                    rule.metric, rule.comparator, rule.limit, observation.source, observation.value
                );
                events.push(AlertEvent {
                    message: describe(rule, observation, observations),
                    severity: rule.severity,
                    timestamp: observation.timestamp,
                    source_metric: rule.metric.clone(),
                    source: observation.source.clone(),
                });
            }
        }

        events
    }
}

/// Human-readable alert text for a fired rule
fn describe(rule: &ThresholdRule, observation: &Observation, batch: &[Observation]) -> String {
    let source = &observation.source;
    match rule.metric.as_str() {
        metrics::SITE_UP => {
            let status = batch
                .iter()
                .find(|o| o.metric == metrics::SITE_STATUS && &o.source == source)
                .map(|o| o.value as u16)
                .unwrap_or(0);
            format!("Site {} is down (last HTTP status {})", source, status)
        }
        metrics::SERVER_UP => format!("Server process {} is not running", source),
        metrics::CERT_DAYS_LEFT => format!(
            "Certificate {} expires in {} day(s)",
            source, observation.value as i64
        ),
        metrics::CERT_WEAK_SIGNATURE => {
            format!("Certificate {} uses a weak signature algorithm", source)
        }
        metrics::CERT_SHORT_KEY => format!("Certificate {} uses an RSA key shorter than 2048 bits", source),
        _ => format!(
            "{} on {} is {:.1} (threshold {} {})",
            rule.metric, source, observation.value, rule.comparator, rule.limit
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use crate::triggers::rules::{default_rules, Comparator};

    #[test]
    fn test_no_rules_no_events() {
        let evaluator = ThresholdEvaluator::new(Vec::new());
        let events = evaluator.evaluate(&[Observation::new(metrics::CPU_PCT, 99.0, "system")]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_multiple_rules_fire_in_one_batch() {
        let evaluator = ThresholdEvaluator::new(default_rules());
        let batch = vec![
            Observation::new(metrics::CPU_PCT, 95.0, "system"),
            Observation::new(metrics::DISK_PCT, 97.0, "system"),
            Observation::new(metrics::MEM_PCT, 40.0, "system"),
        ];
        let events = evaluator.evaluate(&batch);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source_metric, metrics::CPU_PCT);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[1].source_metric, metrics::DISK_PCT);
        assert_eq!(events[1].severity, Severity::Error);
    }

    #[test]
    fn test_cert_expiry_tiers_yield_one_event() {
        let evaluator = ThresholdEvaluator::new(default_rules());

        let events = evaluator.evaluate(&[Observation::new(metrics::CERT_DAYS_LEFT, 5.0, "example.com")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Error);
        assert!(events[0].message.contains("5 day"));

        let events = evaluator.evaluate(&[Observation::new(metrics::CERT_DAYS_LEFT, 12.0, "example.com")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Warning);

        let events = evaluator.evaluate(&[Observation::new(metrics::CERT_DAYS_LEFT, 15.0, "example.com")]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_site_down_message_uses_status_from_batch() {
        let evaluator = ThresholdEvaluator::new(default_rules());
        let batch = vec![
            Observation::new(metrics::SITE_UP, 0.0, "example.com"),
            Observation::new(metrics::SITE_STATUS, 502.0, "example.com"),
            Observation::new(metrics::SITE_UP, 1.0, "other.org"),
            Observation::new(metrics::SITE_STATUS, 200.0, "other.org"),
        ];
        let events = evaluator.evaluate(&batch);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "example.com");
        assert_eq!(events[0].message, "Site example.com is down (last HTTP status 502)");
    }

    #[test]
    fn test_generic_message_format() {
        let evaluator = ThresholdEvaluator::new(vec![ThresholdRule::new(
            "tcp_time_wait",
            Comparator::GreaterThan,
            1000.0,
            Severity::Info,
        )]);
        let events = evaluator.evaluate(&[Observation::new("tcp_time_wait", 1500.0, "system")]);
        assert_eq!(
            events[0].message,
            "tcp_time_wait on system is 1500.0 (threshold > 1000)"
        );
    }

    #[test]
    fn test_set_rules_replaces_rule_set() {
        let mut evaluator = ThresholdEvaluator::new(default_rules());
        assert_eq!(evaluator.rule_count(), default_rules().len());
        evaluator.set_rules(Vec::new());
        assert_eq!(evaluator.rule_count(), 0);
    }
}
