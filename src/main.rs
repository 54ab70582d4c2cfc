use anyhow::{bail, Context};
use caddy_warden::alerts::{AlertManager, DispatchOutcome, HttpTransport};
use caddy_warden::analytics::{render_json, render_text, LogAnalyzer, ReportKind};
use caddy_warden::collectors::CollectScope;
use caddy_warden::config::{load_settings, Settings, SharedSettings};
use caddy_warden::error::TransactionError;
use caddy_warden::maintenance;
use caddy_warden::monitoring::{Monitor, Shutdown};
use caddy_warden::transaction::{failure_alert, CaddyControl, RetentionPolicy, TransactionManager};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;

/// Command-line arguments for caddy-warden
#[derive(Parser)]
#[command(
    name = "caddy-warden",
    about = "Caddy manager - safe Caddyfile transactions, health monitoring and alerting",
    long_about = "Manages a Caddy server: adds and removes sites through validated, reversible \
                  configuration transactions, keeps compressed backups, analyzes access and error \
                  logs, and monitors system, site and certificate health with multi-channel alerts."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        global = true,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Add a reverse-proxy site block
    AddSite { domain: String, upstream: String },
    /// Remove a site block
    RemoveSite { domain: String },
    /// List configured sites
    ListSites,
    /// Snapshot the current Caddyfile
    Backup,
    /// Restore a snapshot (default: the newest)
    Restore {
        #[arg(default_value = "latest")]
        snapshot: String,
    },
    /// List snapshots, newest first
    ListBackups,
    /// Prune snapshots by age or count
    CleanupBackups {
        #[arg(long, conflicts_with = "keep")]
        days: Option<u32>,
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Add HTTP/3 and timeout server options
    Optimize,
    /// Add the security header snippet and import it in every site
    Secure,
    /// Report on the access and error logs
    Analyze {
        #[arg(value_enum, default_value = "all")]
        kind: AnalyzeKind,
        #[arg(long, default_value_t = 24)]
        hours: u32,
        #[arg(long)]
        json: bool,
    },
    /// Run health checks once, or continuously with --watch
    Monitor {
        #[arg(value_enum, default_value = "all")]
        scope: MonitorScope,
        domain: Option<String>,
        #[arg(long)]
        watch: bool,
    },
    /// Delete log files older than DAYS days
    CleanupLogs { days: u32 },
    /// Gzip and truncate oversized logs
    RotateLogs {
        #[arg(long, value_name = "MB")]
        size_mb: Option<u64>,
    },
    /// Send a test alert to every enabled channel
    TestAlert,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum AnalyzeKind {
    Access,
    Error,
    Performance,
    All,
}

impl From<AnalyzeKind> for ReportKind {
    fn from(kind: AnalyzeKind) -> Self {
        match kind {
            AnalyzeKind::Access => ReportKind::Access,
            AnalyzeKind::Error => ReportKind::Error,
            AnalyzeKind::Performance => ReportKind::Performance,
            AnalyzeKind::All => ReportKind::All,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum MonitorScope {
    System,
    Site,
    Cert,
    All,
}

impl From<MonitorScope> for CollectScope {
    fn from(scope: MonitorScope) -> Self {
        match scope {
            MonitorScope::System => CollectScope::System,
            MonitorScope::Site => CollectScope::Site,
            MonitorScope::Cert => CollectScope::Cert,
            MonitorScope::All => CollectScope::All,
        }
    }
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// Missing config files are fine (defaults apply); directories are not.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }
                if config_path.extension().map(|ext| ext != "toml").unwrap_or(true) {
                    warn!(
                        "Configuration file does not have .toml extension: {}",
                        config_path.display()
                    );
                }
            }
        }
        Ok(())
    }
}

impl Command {
    /// Directory this command writes to, if it modifies system state
    fn write_target(&self, settings: &Settings) -> Option<PathBuf> {
        let config_dir = || {
            settings
                .server
                .config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };
        match self {
            Command::AddSite { .. }
            | Command::RemoveSite { .. }
            | Command::Restore { .. }
            | Command::Optimize
            | Command::Secure => Some(config_dir()),
            Command::Backup | Command::CleanupBackups { .. } => Some(settings.backup.dir.clone()),
            Command::CleanupLogs { .. } | Command::RotateLogs { .. } => Some(settings.logs.dir.clone()),
            _ => None,
        }
    }
}

/// Effective uid 0, or write access to the nearest existing ancestor of `dir`
fn check_write_access(dir: &Path) -> Result<(), String> {
    // SAFETY: geteuid has no preconditions and cannot fail
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    let existing = dir
        .ancestors()
        .find(|p| p.exists())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .map_err(|_| format!("Path contains a NUL byte: {}", existing.display()))?;

    // SAFETY: c_path is a valid NUL-terminated string that outlives the call
    if unsafe { libc::access(c_path.as_ptr(), libc::W_OK) } == 0 {
        Ok(())
    } else {
        Err(format!(
            "This command must run as root or with write access to {}",
            existing.display()
        ))
    }
}

/// Command dispatch with the settings and runtime shared by every command
struct App {
    settings: Settings,
    runtime: Runtime,
}

impl App {
    fn transactions(&self) -> TransactionManager {
        TransactionManager::new(
            &self.settings,
            Box::new(CaddyControl::new(&self.settings.server)),
        )
    }

    fn alert_manager(&self) -> anyhow::Result<AlertManager> {
        let timeout = Duration::from_secs(self.settings.monitor.probe_timeout_seconds);
        let transport = HttpTransport::new(timeout).context("failed to build the HTTP client")?;
        Ok(AlertManager::new(&self.settings, Arc::new(transport)))
    }

    /// Alert on validation and reload failures, then turn the error into the exit error
    fn fail(&self, operation: &str, err: TransactionError) -> anyhow::Error {
        if let Some(event) = failure_alert(operation, &err) {
            match self.alert_manager() {
                Ok(mut alerts) => {
                    self.runtime.block_on(alerts.dispatch(&event));
                }
                Err(e) => warn!("Cannot send failure alert: {:#}", e),
            }
        }
        anyhow::Error::new(err).context(format!("{} failed", operation))
    }

    fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::AddSite { domain, upstream } => {
                let snapshot = self
                    .transactions()
                    .add_site(&domain, &upstream)
                    .map_err(|e| self.fail("add-site", e))?;
                println!("Added {} -> {} (backup {})", domain, upstream, snapshot.id);
            }
            Command::RemoveSite { domain } => {
                let snapshot = self
                    .transactions()
                    .remove_site(&domain)
                    .map_err(|e| self.fail("remove-site", e))?;
                println!("Removed {} (backup {})", domain, snapshot.id);
            }
            Command::ListSites => {
                let sites = self.transactions().list_sites()?;
                if sites.is_empty() {
                    println!("No sites configured");
                }
                for site in sites {
                    println!("{}", site);
                }
            }
            Command::Backup => {
                let outcome = self.transactions().backup()?;
                println!("Created backup {}", outcome.snapshot.id);
                if !outcome.pruned.is_empty() {
                    println!("Pruned {} expired backup(s)", outcome.pruned.len());
                }
            }
            Command::Restore { snapshot } => {
                let outcome = self
                    .transactions()
                    .restore(&snapshot)
                    .map_err(|e| self.fail("restore", e))?;
                println!("Restored backup {}", outcome.restored.id);
                if let Some(previous) = outcome.previous {
                    println!("Previous configuration saved as {}", previous.id);
                }
            }
            Command::ListBackups => {
                let snapshots = self.transactions().list_backups()?;
                if snapshots.is_empty() {
                    println!("No backups found");
                }
                for snapshot in snapshots {
                    println!(
                        "{}  {}  {} bytes",
                        snapshot.id,
                        snapshot.created.format("%Y-%m-%d %H:%M:%S UTC"),
                        snapshot.size
                    );
                }
            }
            Command::CleanupBackups { days, keep } => {
                let policy = match (days, keep) {
                    (_, Some(keep)) => RetentionPolicy::keep_newest(keep),
                    (Some(days), None) => RetentionPolicy::max_age_days(days),
                    (None, None) => RetentionPolicy::max_age_days(self.settings.backup.retention_days),
                };
                let removed = self.transactions().cleanup_backups(policy)?;
                println!("Removed {} backup(s)", removed.len());
            }
            Command::Optimize => {
                let snapshot = self
                    .transactions()
                    .optimize()
                    .map_err(|e| self.fail("optimize", e))?;
                println!("Applied performance options (backup {})", snapshot.id);
            }
            Command::Secure => {
                let snapshot = self
                    .transactions()
                    .secure()
                    .map_err(|e| self.fail("secure", e))?;
                println!("Applied security headers (backup {})", snapshot.id);
            }
            Command::Analyze { kind, hours, json } => {
                let report = LogAnalyzer::new(&self.settings.logs).analyze(kind.into(), Utc::now(), hours)?;
                if json {
                    println!("{}", render_json(&report)?);
                } else {
                    print!("{}", render_text(&report));
                }
            }
            Command::Monitor {
                scope,
                domain,
                watch,
            } => self.monitor(scope.into(), domain, watch)?,
            Command::CleanupLogs { days } => {
                let removed = maintenance::cleanup_logs(&self.settings.logs.dir, days, SystemTime::now())?;
                println!("Removed {} log file(s)", removed.len());
            }
            Command::RotateLogs { size_mb } => {
                let limit = size_mb.unwrap_or(self.settings.logs.rotate_size_mb);
                let rotated = maintenance::rotate_logs(&self.settings.logs.dir, limit, Utc::now())?;
                for log in &rotated {
                    println!("{} -> {}", log.original.display(), log.archive.display());
                }
                println!("Rotated {} log file(s)", rotated.len());
            }
            Command::TestAlert => self.test_alert()?,
        }
        Ok(())
    }

    fn monitor(&self, scope: CollectScope, domain: Option<String>, watch: bool) -> anyhow::Result<()> {
        let alerts = self.alert_manager()?;
        let mut monitor = Monitor::new(SharedSettings::new(self.settings.clone()), scope, domain, alerts)?;

        if watch {
            let shutdown = Shutdown::new();
            install_shutdown_handler(&shutdown)?;

            info!("caddy-warden monitor is running. Press Ctrl+C to stop.");
            self.runtime.block_on(monitor.run(&shutdown));
            return Ok(());
        }

        let report = self.runtime.block_on(monitor.run_cycle());
        for observation in &report.observations {
            println!(
                "{:<22} {:<40} {}",
                observation.metric, observation.source, observation.value
            );
        }
        if report.events.is_empty() {
            println!("No thresholds breached");
        }
        for event in &report.events {
            println!("[{}] {}", event.severity.to_string().to_uppercase(), event.message);
        }
        if !report.collector_errors.is_empty() {
            bail!("health collection failed: {}", report.collector_errors.join("; "));
        }
        Ok(())
    }

    fn test_alert(&self) -> anyhow::Result<()> {
        let mut alerts = self.alert_manager()?;
        let outcome = self
            .runtime
            .block_on(alerts.send_test("Test alert from caddy-warden: notification channels are working"));

        match outcome {
            DispatchOutcome::Disabled => bail!("alerting is disabled in the configuration"),
            DispatchOutcome::NoChannels => bail!("no alert channels are enabled"),
            DispatchOutcome::Sent { delivered, failed } => {
                for channel in &delivered {
                    println!("{}: delivered", channel);
                }
                for failure in &failed {
                    println!("{}: failed ({})", failure.channel, failure.error);
                }
                if delivered.is_empty() {
                    bail!("test alert could not be delivered to any channel");
                }
            }
            DispatchOutcome::Suppressed | DispatchOutcome::RateLimited => {}
        }
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let settings = load_settings(cli.config.as_deref());

    if let Some(target) = cli.command.write_target(&settings) {
        if let Err(e) = check_write_access(&target) {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let app = App { settings, runtime };
    if let Err(e) = app.run(cli.command) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Request `shutdown` on SIGINT, SIGTERM or SIGHUP
fn install_shutdown_handler(shutdown: &Shutdown) -> anyhow::Result<()> {
    let handler = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received termination signal, stopping after the current cycle");
        handler.request();
    })
    .context("failed to install the signal handler")
}
