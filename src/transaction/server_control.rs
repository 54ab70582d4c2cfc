use crate::command::{describe, run_checked};
use crate::config::ServerSettings;
use crate::error::ControlError;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Black-box control over the managed server
///
/// The transaction manager only needs to know whether a configuration file is acceptable
/// and whether a reload took effect.
#[cfg_attr(test, mockall::automock)]
pub trait ServerControl: Send + Sync {
    /// Check a configuration file without applying it
    fn validate(&self, config: &Path) -> Result<(), ControlError>;

    /// Make the running server pick up the live configuration
    fn reload(&self) -> Result<(), ControlError>;
}

/// Controls Caddy through its command-line interface
pub struct CaddyControl {
    binary: String,
    adapter: String,
    config_path: PathBuf,
    reload_command: Vec<String>,
    timeout: Duration,
}

impl CaddyControl {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            adapter: settings.adapter.clone(),
            config_path: settings.config_path.clone(),
            reload_command: settings.reload_command.clone(),
            timeout: Duration::from_secs(settings.command_timeout_seconds),
        }
    }

    fn validate_command(&self, config: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("validate")
            .arg("--config")
            .arg(config)
            .arg("--adapter")
            .arg(&self.adapter);
        command
    }

    fn reload_command(&self) -> Command {
        match self.reload_command.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            None => {
                let mut command = Command::new(&self.binary);
                command
                    .arg("reload")
                    .arg("--config")
                    .arg(&self.config_path)
                    .arg("--adapter")
                    .arg(&self.adapter);
                command
            }
        }
    }
}

impl ServerControl for CaddyControl {
    fn validate(&self, config: &Path) -> Result<(), ControlError> {
        let mut command = self.validate_command(config);
        match run_checked(&mut command, self.timeout) {
            Ok(_) => {
                info!("Configuration {} passed validation", config.display());
                Ok(())
            }
            Err(e) => {
                warn!("Validation of {} failed: {}", config.display(), e);
                Err(e)
            }
        }
    }

    fn reload(&self) -> Result<(), ControlError> {
        let mut command = self.reload_command();
        info!("Reloading server: {}", describe(&command));
        run_checked(&mut command, self.timeout).map(|_| ())
    }
}
