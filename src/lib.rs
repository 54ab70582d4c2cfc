/// Error types for caddy-warden
pub mod error;

/// Observations, alert events and log records
pub mod events;

/// Bounded retry with a fixed delay
pub mod retry;

/// External command execution with timeouts
pub mod command;

/// Caddyfile document model and block templates
pub mod caddyfile;

/// Validated, reversible Caddyfile transactions and backups
pub mod transaction;

/// System, site and certificate health collectors
pub mod collectors;

/// Access and error log analytics
pub mod analytics;

/// Threshold rules and their evaluation
pub mod triggers;

/// Alert dispatch to notification channels
pub mod alerts;

/// The periodic monitor loop
pub mod monitoring;

/// Log retention and rotation
pub mod maintenance;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{
    AlertError, AnalysisError, CollectorError, ConfigError, MaintenanceError, TransactionError,
};
