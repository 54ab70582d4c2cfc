/// Settings file model and loading
pub mod settings;

pub use settings::{
    AlertSettings, BackupSettings, ChannelConfig, ChannelKind, LogSettings, MessageFormat,
    MonitorSettings, ServerSettings, Settings,
};

use log::{error, info, warn};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

/// Process-wide settings, loaded once and shared read-mostly
///
/// Channels and threshold rules are the only mutable state shared between the monitor
/// loop and operator commands; writers go through [`SharedSettings::update`].
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Read access; a poisoned lock still yields the last written value
    pub fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of the current settings
    pub fn snapshot(&self) -> Settings {
        self.read().clone()
    }

    /// Apply a change under the write lock
    pub fn update<F: FnOnce(&mut Settings)>(&self, change: F) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut guard);
    }
}

/// Load settings from file or fall back to defaults
///
/// A missing or unreadable file falls back to defaults with a warning; an invalid one is
/// reported and also falls back, so monitoring can still start.
pub fn load_settings(path: Option<&Path>) -> Settings {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Settings::from_file(path) {
                Ok(settings) => settings,
                Err(crate::error::ConfigError::ReadError(e)) => {
                    warn!("Configuration file not found or unreadable ({}), using defaults", e);
                    Settings::default()
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Settings::default()
                }
            }
        }
        None => {
            info!("Using default configuration");
            Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_update_is_visible_to_readers() {
        let shared = SharedSettings::new(Settings::default());
        let reader = shared.clone();
        shared.update(|s| s.alerts.enabled = false);
        assert!(!reader.read().alerts.enabled);
    }

    #[test]
    fn test_load_settings_falls_back_on_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\ninterval_seconds = 0").unwrap();
        let settings = load_settings(Some(file.path()));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings_reads_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\ninterval_seconds = 60").unwrap();
        let settings = load_settings(Some(file.path()));
        assert_eq!(settings.monitor.interval_seconds, 60);
    }

    #[test]
    fn test_load_settings_without_path() {
        assert_eq!(load_settings(None), Settings::default());
    }
}
