//! Threshold rules and the built-in default rule set
//!
//! A rule is a plain (metric, comparator, limit, severity) tuple. Rules are stateless:
//! the same observation always produces the same verdict.

use crate::events::{metrics, Observation, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison applied between an observation value and a rule limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Comparator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Comparator {
    pub fn compare(self, value: f64, limit: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > limit,
            Comparator::GreaterOrEqual => value >= limit,
            Comparator::LessThan => value < limit,
            Comparator::LessOrEqual => value <= limit,
            Comparator::Equal => (value - limit).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparator::GreaterThan => ">",
            Comparator::GreaterOrEqual => ">=",
            Comparator::LessThan => "<",
            Comparator::LessOrEqual => "<=",
            Comparator::Equal => "==",
        };
        write!(f, "{}", symbol)
    }
}

/// One threshold rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    pub metric: String,
    pub comparator: Comparator,
    pub limit: f64,
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn new(
        metric: impl Into<String>,
        comparator: Comparator,
        limit: f64,
        severity: Severity,
    ) -> Self {
        Self {
            metric: metric.into(),
            comparator,
            limit,
            severity,
        }
    }

    /// Whether this rule fires for the observation
    pub fn fires(&self, observation: &Observation) -> bool {
        observation.metric == self.metric && self.comparator.compare(observation.value, self.limit)
    }
}

/// Built-in rules used when the settings file names none
pub fn default_rules() -> Vec<ThresholdRule> {
    use Comparator::*;
    vec![
        ThresholdRule::new(metrics::CPU_PCT, GreaterThan, 85.0, Severity::Warning),
        ThresholdRule::new(metrics::MEM_PCT, GreaterThan, 90.0, Severity::Warning),
        ThresholdRule::new(metrics::DISK_PCT, GreaterThan, 90.0, Severity::Error),
        ThresholdRule::new(metrics::SERVER_UP, LessThan, 1.0, Severity::Error),
        ThresholdRule::new(metrics::SITE_UP, LessThan, 1.0, Severity::Error),
        ThresholdRule::new(metrics::CERT_DAYS_LEFT, LessOrEqual, 14.0, Severity::Warning),
        ThresholdRule::new(metrics::CERT_DAYS_LEFT, LessOrEqual, 7.0, Severity::Error),
        ThresholdRule::new(metrics::CERT_WEAK_SIGNATURE, GreaterOrEqual, 1.0, Severity::Warning),
        ThresholdRule::new(metrics::CERT_SHORT_KEY, GreaterOrEqual, 1.0, Severity::Warning),
        ThresholdRule::new(metrics::HTTP_5XX_COUNT, GreaterThan, 50.0, Severity::Warning),
    ]
}
