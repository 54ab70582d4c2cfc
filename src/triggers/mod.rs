/// Threshold evaluator and rule definitions
pub mod rules;
pub mod trigger_engine;

pub use rules::{default_rules, Comparator, ThresholdRule};
pub use trigger_engine::ThresholdEvaluator;
