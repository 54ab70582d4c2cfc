/// Dispatch pipeline: dedup, rate limit, per-channel delivery, audit
pub mod alert_manager;

/// JSON-lines audit trail of dispatches
pub mod audit;

/// Message rendering and HTTP transport per channel kind
pub mod channels;

/// Suppression of repeated (metric, severity) pairs
pub mod dedup;

pub mod rate_limiter;

pub use alert_manager::{AlertManager, DispatchOutcome};
pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use channels::{HttpTransport, NotificationTransport};
pub use dedup::Deduplicator;
pub use rate_limiter::RateLimiter;
