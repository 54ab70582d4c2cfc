/// Exclusive advisory lock on the configuration
pub mod lock;

/// Snapshot, mutate, validate, commit or roll back
pub mod manager;

/// Validate and reload through the server binary
pub mod server_control;

/// Compressed backup snapshots and retention
pub mod snapshots;

pub use manager::{failure_alert, BackupOutcome, RestoreOutcome, TransactionManager, TransactionState};
pub use server_control::{CaddyControl, ServerControl};
pub use snapshots::{RetentionPolicy, Snapshot, SnapshotStore};
