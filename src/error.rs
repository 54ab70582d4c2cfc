use std::path::PathBuf;
use thiserror::Error;

/// Remediation text attached to I/O failures surfaced to the operator
pub const IO_REMEDIATION: &str =
    "check file permissions and free disk space, then retry the command";

/// Errors produced by configuration transactions against the Caddyfile
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration failed validation, live configuration unchanged (snapshot {snapshot}): {reason}")]
    ValidationFailed { snapshot: String, reason: String },

    #[error("Configuration written but server reload failed: {0}. The file on disk is the new configuration; reload manually once the cause is fixed")]
    ReloadFailed(String),

    #[error("I/O failure on {}: {source} ({})", .path.display(), IO_REMEDIATION)]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransactionError {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransactionError::IoFailure {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the external server control commands (validate, reload)
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: std::time::Duration,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur in health collectors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Failed to spawn subprocess: {0}")]
    SubprocessSpawn(String),

    #[error("Subprocess timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to parse output: {0}")]
    ParseError(String),

    #[error("Probe task failed: {0}")]
    TaskFailed(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Failed to read server configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur during log analysis
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Log unavailable: {0}")]
    LogUnavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur when sending alerts
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Failed to send notification: {0}")]
    NotificationFailed(String),

    #[error("Channel {channel} returned HTTP {status}: {body}")]
    HttpStatus {
        channel: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors from log retention and rotation
#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("I/O failure on {}: {source} ({})", .path.display(), IO_REMEDIATION)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failure_carries_remediation() {
        let err = TransactionError::io(
            "/etc/caddy/Caddyfile",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("/etc/caddy/Caddyfile"));
        assert!(text.contains(IO_REMEDIATION));
    }

    #[test]
    fn test_reload_failed_mentions_manual_action() {
        let err = TransactionError::ReloadFailed("exit status 1".to_string());
        assert!(err.to_string().contains("reload manually"));
    }
}
