use super::lock::ConfigLock;
use super::server_control::ServerControl;
use super::snapshots::{RetentionPolicy, Snapshot, SnapshotStore};
use crate::caddyfile::templates::{
    is_valid_domain, is_valid_upstream, site_block, PERFORMANCE_DIRECTIVES, SECURITY_BLOCK,
    SECURITY_IMPORT, SECURITY_SNIPPET,
};
use crate::caddyfile::{Block, CaddyDocument};
use crate::config::Settings;
use crate::error::TransactionError;
use crate::events::{AlertEvent, Severity};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Metric name carried by alerts about failed transactions
pub const TRANSACTION_METRIC: &str = "config_transaction";

/// Lifecycle of a single configuration transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Snapshotting,
    Mutated,
    Validating,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::Snapshotting => "snapshotting",
            TransactionState::Mutated => "mutated",
            TransactionState::Validating => "validating",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled-back",
        };
        write!(f, "{}", name)
    }
}

/// Result of an explicit backup
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub snapshot: Snapshot,
    pub pruned: Vec<Snapshot>,
}

/// Result of a restore
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub restored: Snapshot,
    /// Snapshot of the document that was replaced
    pub previous: Option<Snapshot>,
}

/// Applies every configuration change as snapshot, mutate, validate, then reload or roll back
pub struct TransactionManager {
    control: Box<dyn ServerControl>,
    config_path: PathBuf,
    lock_path: PathBuf,
    log_dir: PathBuf,
    snapshots: SnapshotStore,
    retention: RetentionPolicy,
    guard: Mutex<()>,
}

impl TransactionManager {
    pub fn new(settings: &Settings, control: Box<dyn ServerControl>) -> Self {
        Self {
            control,
            config_path: settings.server.config_path.clone(),
            lock_path: settings.lock_path(),
            log_dir: settings.logs.dir.clone(),
            snapshots: SnapshotStore::new(settings.backup.dir.clone()),
            retention: RetentionPolicy {
                max_age: Some(chrono::Duration::days(i64::from(
                    settings.backup.retention_days,
                ))),
                keep: settings.backup.keep_count,
            },
            guard: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Append a reverse-proxy site block for `domain`
    ///
    /// # Arguments
    ///
    /// * `domain` - Hostname, optionally with a leading `*.` wildcard label
    /// * `upstream` - `host:port`, `:port` or an `http(s)://host:port` URL
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a malformed domain or upstream, `Conflict` if the domain already
    /// has a site block, plus the failures common to every transaction.
    pub fn add_site(&self, domain: &str, upstream: &str) -> Result<Snapshot, TransactionError> {
        if !is_valid_domain(domain) {
            return Err(TransactionError::InvalidInput(format!(
                "'{}' is not a valid domain name",
                domain
            )));
        }
        if !is_valid_upstream(upstream) {
            return Err(TransactionError::InvalidInput(format!(
                "'{}' is not a valid upstream (expected host:port)",
                upstream
            )));
        }

        let block = site_block(domain, upstream, &self.log_dir);
        self.transact("add-site", |document| {
            if document.contains_site(domain) {
                return Err(TransactionError::Conflict(format!(
                    "site {} already exists",
                    domain
                )));
            }
            document
                .append_block(&block)
                .map_err(|e| TransactionError::InvalidInput(format!("generated block: {}", e)))
        })
    }

    /// Remove the site block identified by `domain`
    pub fn remove_site(&self, domain: &str) -> Result<Snapshot, TransactionError> {
        self.transact("remove-site", |document| {
            document
                .remove_site(domain)
                .map(|_| ())
                .ok_or_else(|| TransactionError::NotFound(format!("site {}", domain)))
        })
    }

    /// Add the performance stanza to the global options block
    pub fn optimize(&self) -> Result<Snapshot, TransactionError> {
        self.transact("optimize", |document| {
            if document.global().map(has_servers_stanza).unwrap_or(false) {
                return Err(TransactionError::Conflict(
                    "global options already contain a servers stanza".to_string(),
                ));
            }
            document.insert_global_directives(PERFORMANCE_DIRECTIVES);
            Ok(())
        })
    }

    /// Add the security headers snippet and import it into every site
    pub fn secure(&self) -> Result<Snapshot, TransactionError> {
        self.transact("secure", |document| {
            if document.contains_snippet(SECURITY_SNIPPET) {
                return Err(TransactionError::Conflict(format!(
                    "snippet ({}) is already present",
                    SECURITY_SNIPPET
                )));
            }
            document
                .insert_after_global(SECURITY_BLOCK)
                .map_err(|e| TransactionError::InvalidInput(format!("security snippet: {}", e)))?;
            let updated = document.add_directive_to_sites(SECURITY_IMPORT);
            debug!("Imported security snippet into {} site(s)", updated);
            Ok(())
        })
    }

    /// Snapshot the live document, then prune by the configured retention
    pub fn backup(&self) -> Result<BackupOutcome, TransactionError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = ConfigLock::acquire(&self.lock_path)?;

        let content = self.read_config()?;
        let snapshot = self.snapshots.create(content.as_bytes())?;
        let pruned = self.snapshots.prune(self.retention, Utc::now())?;
        Ok(BackupOutcome { snapshot, pruned })
    }

    /// Replace the live document with a snapshot
    ///
    /// The candidate is validated from a temporary sibling file and only then renamed over
    /// the live document, so a rejected snapshot never touches it.
    ///
    /// # Arguments
    ///
    /// * `id` - Snapshot id, or `latest`
    pub fn restore(&self, id: &str) -> Result<RestoreOutcome, TransactionError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = ConfigLock::acquire(&self.lock_path)?;

        let restored = self.snapshots.find(id)?;
        let content = self.snapshots.read(&restored)?;
        info!("Restoring snapshot {}", restored.id);

        let previous = match fs::read(&self.config_path) {
            Ok(current) => Some(self.snapshots.create(&current)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(TransactionError::io(&self.config_path, e)),
        };

        let candidate = self.candidate_path(&restored.id);
        fs::write(&candidate, &content).map_err(|e| TransactionError::io(&candidate, e))?;

        if let Err(e) = self.control.validate(&candidate) {
            let _ = fs::remove_file(&candidate);
            warn!("Snapshot {} rejected by validation: {}", restored.id, e);
            return Err(TransactionError::ValidationFailed {
                snapshot: restored.id,
                reason: e.to_string(),
            });
        }

        let install = || -> std::io::Result<()> {
            fs::set_permissions(&candidate, fs::Permissions::from_mode(0o644))?;
            fs::rename(&candidate, &self.config_path)
        };
        if let Err(e) = install() {
            let _ = fs::remove_file(&candidate);
            return Err(TransactionError::io(&self.config_path, e));
        }

        self.control
            .reload()
            .map_err(|e| TransactionError::ReloadFailed(e.to_string()))?;
        info!("Restored snapshot {}", restored.id);
        Ok(RestoreOutcome { restored, previous })
    }

    /// Site identifiers in document order
    pub fn list_sites(&self) -> Result<Vec<String>, TransactionError> {
        Ok(self.parse_config()?.site_identifiers())
    }

    /// Snapshots, newest first
    pub fn list_backups(&self) -> Result<Vec<Snapshot>, TransactionError> {
        self.snapshots.list()
    }

    /// Prune snapshots with an explicit policy
    pub fn cleanup_backups(&self, policy: RetentionPolicy) -> Result<Vec<Snapshot>, TransactionError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshots.prune(policy, Utc::now())
    }

    fn transact<F>(&self, operation: &str, mutate: F) -> Result<Snapshot, TransactionError>
    where
        F: FnOnce(&mut CaddyDocument) -> Result<(), TransactionError>,
    {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = ConfigLock::acquire(&self.lock_path)?;
        let mut state = TransactionState::Idle;
        debug!("{}: {}", operation, state);

        let original = self.read_config()?;
        let mut document = parse_document(&self.config_path, &original)?;
        mutate(&mut document)?;

        advance(operation, &mut state, TransactionState::Snapshotting);
        let snapshot = self.snapshots.create(original.as_bytes())?;

        advance(operation, &mut state, TransactionState::Mutated);
        if let Err(e) = fs::write(&self.config_path, document.to_string()) {
            self.roll_back(operation, &original)?;
            return Err(TransactionError::io(&self.config_path, e));
        }

        advance(operation, &mut state, TransactionState::Validating);
        if let Err(e) = self.control.validate(&self.config_path) {
            warn!("{}: validation failed: {}", operation, e);
            self.roll_back(operation, &original)?;
            advance(operation, &mut state, TransactionState::RolledBack);
            return Err(TransactionError::ValidationFailed {
                snapshot: snapshot.id,
                reason: e.to_string(),
            });
        }

        if let Err(e) = self.control.reload() {
            error!("{}: reload failed: {}", operation, e);
            return Err(TransactionError::ReloadFailed(e.to_string()));
        }
        advance(operation, &mut state, TransactionState::Committed);
        info!("{} committed (snapshot {})", operation, snapshot.id);
        Ok(snapshot)
    }

    fn roll_back(&self, operation: &str, original: &str) -> Result<(), TransactionError> {
        fs::write(&self.config_path, original).map_err(|e| {
            error!("{}: rollback of {} failed: {}", operation, self.config_path.display(), e);
            TransactionError::io(&self.config_path, e)
        })
    }

    fn read_config(&self) -> Result<String, TransactionError> {
        let bytes = fs::read(&self.config_path).map_err(|e| TransactionError::io(&self.config_path, e))?;
        String::from_utf8(bytes).map_err(|_| {
            TransactionError::InvalidInput(format!(
                "{} is not valid UTF-8",
                self.config_path.display()
            ))
        })
    }

    fn parse_config(&self) -> Result<CaddyDocument, TransactionError> {
        let content = self.read_config()?;
        parse_document(&self.config_path, &content)
    }

    fn candidate_path(&self, id: &str) -> PathBuf {
        let name = self
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Caddyfile".to_string());
        self.config_path
            .with_file_name(format!(".{}.restore-{}", name, id))
    }
}

fn advance(operation: &str, state: &mut TransactionState, next: TransactionState) {
    debug!("{}: {} -> {}", operation, state, next);
    *state = next;
}

fn parse_document(path: &Path, content: &str) -> Result<CaddyDocument, TransactionError> {
    CaddyDocument::parse(content).map_err(|e| {
        TransactionError::InvalidInput(format!("{} cannot be parsed: {}", path.display(), e))
    })
}

fn has_servers_stanza(global: &Block) -> bool {
    global
        .text
        .lines()
        .skip(1)
        .any(|line| line.split_whitespace().next() == Some("servers"))
}

/// Alert raised when a transaction leaves the server in a state that needs attention
///
/// Rejected input never alerts; a rolled-back change warns and a failed reload is an error.
pub fn failure_alert(operation: &str, err: &TransactionError) -> Option<AlertEvent> {
    let severity = match err {
        TransactionError::ValidationFailed { .. } => Severity::Warning,
        TransactionError::ReloadFailed(_) => Severity::Error,
        _ => return None,
    };
    Some(AlertEvent::new(
        format!("{} failed: {}", operation, err),
        severity,
        TRANSACTION_METRIC,
        operation,
    ))
}
