use crate::error::ConfigError;
use crate::events::Severity;
use crate::triggers::rules::{default_rules, ThresholdRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings loaded once at startup from a TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub logs: LogSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
}

/// The managed server and its configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// Server binary, used for validate/reload and the liveness check
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_adapter")]
    pub adapter: String,
    /// Overrides the reload command, e.g. `["systemctl", "reload", "caddy"]`
    #[serde(default)]
    pub reload_command: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSettings {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// When set, keep only this many snapshots in addition to the age rule
    #[serde(default)]
    pub keep_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSettings {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_access_log")]
    pub access_log: PathBuf,
    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,
    #[serde(default = "default_slow_request_ms")]
    pub slow_request_ms: f64,
    #[serde(default = "default_rotate_size_mb")]
    pub rotate_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSettings {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_retry_interval")]
    pub probe_retry_interval_seconds: u64,
    /// HTTP statuses that count as a site being up; anything else is retried
    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: Vec<u16>,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// Sites probed in addition to the ones found in the Caddyfile
    #[serde(default)]
    pub extra_sites: Vec<String>,
    /// Also evaluate access-log statistics every cycle
    #[serde(default = "default_true")]
    pub include_access_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dedup window; defaults to one monitor interval when unset
    #[serde(default)]
    pub suppression_window_seconds: Option<u64>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_rules")]
    pub rules: Vec<ThresholdRule>,
}

/// Kind of notification endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Generic webhook receiving `{"text": ...}`
    Webhook,
    Slack,
    Discord,
    Telegram,
}

/// How a channel's message is rendered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Text,
    Markdown,
}

/// One notification endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    /// Webhook URL, or the bot token for Telegram
    pub url: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub format: Option<MessageFormat>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum severity delivered to this channel
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

impl ChannelConfig {
    /// Display name used in logs and the audit trail
    pub fn name(&self) -> &'static str {
        match self.kind {
            ChannelKind::Webhook => "webhook",
            ChannelKind::Slack => "slack",
            ChannelKind::Discord => "discord",
            ChannelKind::Telegram => "telegram",
        }
    }

    /// Explicit format, or the kind's natural one
    pub fn effective_format(&self) -> MessageFormat {
        self.format.unwrap_or(match self.kind {
            ChannelKind::Webhook => MessageFormat::Text,
            _ => MessageFormat::Markdown,
        })
    }
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/caddy/Caddyfile")
}

fn default_binary() -> String {
    "caddy".to_string()
}

fn default_adapter() -> String {
    "caddyfile".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/etc/caddy/backups")
}

fn default_retention_days() -> u32 {
    30
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/caddy")
}

fn default_access_log() -> PathBuf {
    PathBuf::from("/var/log/caddy/access.log")
}

fn default_error_log() -> PathBuf {
    PathBuf::from("/var/log/caddy/error.log")
}

fn default_slow_request_ms() -> f64 {
    2000.0
}

fn default_rotate_size_mb() -> u64 {
    100
}

fn default_interval() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_attempts() -> u32 {
    3
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200]
}

fn default_probe_retry_interval() -> u64 {
    5
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/var/lib/caddy/.local/share/caddy/certificates")
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> usize {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    5
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("/var/log/caddy-warden/alerts.log")
}

fn default_min_severity() -> Severity {
    Severity::Info
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            binary: default_binary(),
            adapter: default_adapter(),
            reload_command: Vec::new(),
            command_timeout_seconds: default_command_timeout(),
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            retention_days: default_retention_days(),
            keep_count: None,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            access_log: default_access_log(),
            error_log: default_error_log(),
            slow_request_ms: default_slow_request_ms(),
            rotate_size_mb: default_rotate_size_mb(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            probe_attempts: default_probe_attempts(),
            probe_retry_interval_seconds: default_probe_retry_interval(),
            healthy_statuses: default_healthy_statuses(),
            cert_dir: default_cert_dir(),
            extra_sites: Vec::new(),
            include_access_log: true,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_window_seconds: None,
            rate_limit_per_minute: default_rate_limit(),
            retry_attempts: default_retry_attempts(),
            retry_interval_seconds: default_retry_interval(),
            audit_log: default_audit_log(),
            channels: Vec::new(),
            rules: default_rules(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file and validate them
    ///
    /// # Errors
    ///
    /// `ConfigError::ReadError` if the file cannot be read, `ConfigError::TomlError` if it
    /// does not parse, `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the rest of the system cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.interval_seconds must be greater than 0".to_string(),
            ));
        }
        if self.monitor.probe_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.probe_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.monitor.healthy_statuses.is_empty() {
            return Err(ConfigError::ValidationError(
                "monitor.healthy_statuses must list at least one status".to_string(),
            ));
        }
        if self.server.command_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "server.command_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.alerts.rate_limit_per_minute == 0 {
            return Err(ConfigError::ValidationError(
                "alerts.rate_limit_per_minute must be greater than 0".to_string(),
            ));
        }
        if self.logs.slow_request_ms < 0.0 || !self.logs.slow_request_ms.is_finite() {
            return Err(ConfigError::ValidationError(
                "logs.slow_request_ms must be a non-negative number".to_string(),
            ));
        }
        for channel in &self.alerts.channels {
            if channel.url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{} channel has an empty url",
                    channel.name()
                )));
            }
            if channel.kind == ChannelKind::Telegram && channel.chat_id.is_none() {
                return Err(ConfigError::ValidationError(
                    "telegram channel requires chat_id".to_string(),
                ));
            }
        }
        for rule in &self.alerts.rules {
            if !rule.limit.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "rule on {} has a non-finite limit",
                    rule.metric
                )));
            }
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_seconds)
    }

    /// Dedup window, one monitor interval unless configured
    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(
            self.alerts
                .suppression_window_seconds
                .unwrap_or(self.monitor.interval_seconds),
        )
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.server.command_timeout_seconds)
    }

    /// Lock file guarding configuration transactions
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .server
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "Caddyfile".into());
        name.push(".lock");
        self.server.config_path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::rules::Comparator;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.monitor.interval_seconds, 300);
        assert_eq!(settings.monitor.probe_timeout_seconds, 10);
        assert_eq!(settings.backup.retention_days, 30);
        assert_eq!(settings.logs.slow_request_ms, 2000.0);
        assert_eq!(settings.monitor.healthy_statuses, vec![200]);
        assert!(settings.alerts.enabled);
        assert!(!settings.alerts.rules.is_empty());
    }

    #[test]
    fn test_suppression_window_defaults_to_interval() {
        let mut settings = Settings::default();
        settings.monitor.interval_seconds = 120;
        assert_eq!(settings.suppression_window(), Duration::from_secs(120));

        settings.alerts.suppression_window_seconds = Some(900);
        assert_eq!(settings.suppression_window(), Duration::from_secs(900));
    }

    #[test]
    fn test_parse_channels_and_rules() {
        let toml = r#"
            [server]
            config_path = "/tmp/Caddyfile"

            [alerts]
            rate_limit_per_minute = 5

            [[alerts.channels]]
            kind = "slack"
            url = "https://hooks.slack.com/services/T/B/X"

            [[alerts.channels]]
            kind = "telegram"
            url = "123:abc"
            chat_id = "-100200"
            min_severity = "error"

            [[alerts.rules]]
            metric = "cpu_pct"
            comparator = ">"
            limit = 75.0
            severity = "warning"
        "#;

        let settings = Settings::from_toml_str(toml).unwrap();
        assert_eq!(settings.server.config_path, PathBuf::from("/tmp/Caddyfile"));
        assert_eq!(settings.alerts.channels.len(), 2);
        assert_eq!(settings.alerts.channels[0].kind, ChannelKind::Slack);
        assert_eq!(
            settings.alerts.channels[0].effective_format(),
            MessageFormat::Markdown
        );
        assert_eq!(settings.alerts.channels[1].min_severity, Severity::Error);
        assert_eq!(settings.alerts.rules.len(), 1);
        assert_eq!(settings.alerts.rules[0].comparator, Comparator::GreaterThan);
    }

    #[test]
    fn test_telegram_without_chat_id_is_rejected() {
        let toml = r#"
            [[alerts.channels]]
            kind = "telegram"
            url = "123:abc"
        "#;
        assert!(matches!(
            Settings::from_toml_str(toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let toml = "[monitor]\ninterval_seconds = 0\n";
        assert!(matches!(
            Settings::from_toml_str(toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_healthy_statuses() {
        let settings = Settings::from_toml_str("[monitor]\nhealthy_statuses = [200, 204]\n").unwrap();
        assert_eq!(settings.monitor.healthy_statuses, vec![200, 204]);

        assert!(matches!(
            Settings::from_toml_str("[monitor]\nhealthy_statuses = []\n"),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = Settings::from_file(Path::new("/nonexistent/warden.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_webhook_defaults_to_text_format() {
        let channel = ChannelConfig {
            kind: ChannelKind::Webhook,
            url: "https://example.org/hook".to_string(),
            chat_id: None,
            format: None,
            enabled: true,
            min_severity: Severity::Info,
        };
        assert_eq!(channel.effective_format(), MessageFormat::Text);
    }

    #[test]
    fn test_lock_path_sits_next_to_config() {
        let mut settings = Settings::default();
        settings.server.config_path = PathBuf::from("/srv/caddy/Caddyfile");
        assert_eq!(settings.lock_path(), PathBuf::from("/srv/caddy/Caddyfile.lock"));
    }
}
