use super::cert_collector::CertCollector;
use super::site_collector::{SiteProbe, SiteStatus};
use super::system_collector::SystemCollector;
use crate::caddyfile::CaddyDocument;
use crate::config::Settings;
use crate::error::CollectorError;
use crate::events::Observation;
use crate::retry::RetryPolicy;
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which collectors a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectScope {
    System,
    Site,
    Cert,
    All,
}

impl CollectScope {
    fn includes(self, other: CollectScope) -> bool {
        self == CollectScope::All || self == other
    }

    pub fn name(self) -> &'static str {
        match self {
            CollectScope::System => "system",
            CollectScope::Site => "site",
            CollectScope::Cert => "cert",
            CollectScope::All => "all",
        }
    }
}

/// A collector that could not finish during a cycle
#[derive(Debug)]
pub struct CollectorFailure {
    pub collector: CollectScope,
    pub error: CollectorError,
}

impl fmt::Display for CollectorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.collector.name(), self.error)
    }
}

/// Observations from the collectors that succeeded, and the failures of those that did not
#[derive(Debug, Default)]
pub struct Collection {
    pub observations: Vec<Observation>,
    pub failures: Vec<CollectorFailure>,
}

impl Collection {
    fn gather(&mut self, collector: CollectScope, result: Result<Vec<Observation>, CollectorError>) {
        match result {
            Ok(observations) => self.observations.extend(observations),
            Err(error) => {
                warn!("The {} collector failed: {}", collector.name(), error);
                self.failures.push(CollectorFailure { collector, error });
            }
        }
    }
}

/// Addresses worth probing: concrete hosts from the Caddyfile plus configured extras
///
/// Wildcards, bare `:port` listeners and placeholders cannot be probed and are skipped.
pub fn monitored_sites(document: Option<&CaddyDocument>, extra: &[String]) -> Vec<String> {
    let mut sites: Vec<String> = Vec::new();
    let candidates = document
        .map(|doc| doc.site_addresses())
        .unwrap_or_default()
        .into_iter()
        .chain(extra.iter().cloned());
    for address in candidates {
        let probeable = !address.is_empty()
            && !address.starts_with(':')
            && !address.contains('*')
            && !address.contains('{');
        if probeable && !sites.contains(&address) {
            sites.push(address);
        }
    }
    sites
}

/// Runs the system, site and certificate collectors for one cycle
pub struct HealthCollector {
    config_path: PathBuf,
    binary: String,
    extra_sites: Vec<String>,
    cert_dir: PathBuf,
    command_timeout: Duration,
    probe: SiteProbe,
}

impl HealthCollector {
    pub fn new(settings: &Settings) -> Result<Self, CollectorError> {
        let monitor = &settings.monitor;
        let probe = SiteProbe::new(
            Duration::from_secs(monitor.probe_timeout_seconds),
            RetryPolicy::new(
                monitor.probe_attempts,
                Duration::from_secs(monitor.probe_retry_interval_seconds),
            ),
            monitor.healthy_statuses.clone(),
        )?;
        Ok(Self {
            config_path: settings.server.config_path.clone(),
            binary: settings.server.binary.clone(),
            extra_sites: monitor.extra_sites.clone(),
            cert_dir: monitor.cert_dir.clone(),
            command_timeout: settings.command_timeout(),
            probe,
        })
    }

    /// Sites to probe; `domain` narrows the set to one site
    pub fn sites(&self, domain: Option<&str>) -> Vec<String> {
        if let Some(domain) = domain {
            return vec![domain.to_string()];
        }
        let document = match fs::read_to_string(&self.config_path) {
            Ok(content) => match CaddyDocument::parse(&content) {
                Ok(document) => Some(document),
                Err(e) => {
                    warn!("Cannot parse {}: {}", self.config_path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Cannot read {}: {}", self.config_path.display(), e);
                None
            }
        };
        monitored_sites(document.as_ref(), &self.extra_sites)
    }

    /// Sample the host on a blocking task
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::TaskFailed` if the sampling task panicked.
    pub async fn collect_system(&self) -> Result<Vec<Observation>, CollectorError> {
        let binary = self.binary.clone();
        let disk_path = self
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        tokio::task::spawn_blocking(move || SystemCollector::new(&binary, &disk_path).collect())
            .await
            .map_err(|e| CollectorError::TaskFailed(e.to_string()))
    }

    /// Probe every monitored site concurrently
    pub async fn collect_sites(&self, domain: Option<&str>) -> Result<Vec<SiteStatus>, CollectorError> {
        let sites = self.sites(domain);
        if sites.is_empty() {
            info!("No sites to probe");
            return Ok(Vec::new());
        }
        self.probe.probe_all(&sites).await
    }

    /// Inspect the certificate store on a blocking task
    ///
    /// # Errors
    ///
    /// Returns `CollectorError` when the store cannot be listed or the task panicked.
    pub async fn collect_certs(&self, domain: Option<&str>) -> Result<Vec<Observation>, CollectorError> {
        let collector = CertCollector::new(self.cert_dir.clone(), self.command_timeout);
        let domain = domain.map(str::to_string);
        tokio::task::spawn_blocking(move || collector.collect(domain.as_deref(), Utc::now()))
            .await
            .map_err(|e| CollectorError::TaskFailed(e.to_string()))?
    }

    /// Run the collectors in `scope`; all site probes finish before this returns
    ///
    /// Each collector runs on its own. One that fails is recorded in
    /// `Collection::failures` and the observations of the others are kept.
    ///
    /// # Arguments
    ///
    /// * `scope` - Which collectors to run
    /// * `domain` - Restrict site and certificate checks to one domain
    pub async fn collect(&self, scope: CollectScope, domain: Option<&str>) -> Collection {
        let mut collection = Collection::default();
        if scope.includes(CollectScope::System) {
            collection.gather(CollectScope::System, self.collect_system().await);
        }
        if scope.includes(CollectScope::Site) {
            let sites = self.collect_sites(domain).await.map(|statuses| {
                statuses.iter().flat_map(SiteStatus::observations).collect()
            });
            collection.gather(CollectScope::Site, sites);
        }
        if scope.includes(CollectScope::Cert) {
            collection.gather(CollectScope::Cert, self.collect_certs(domain).await);
        }
        debug!(
            "Collected {} observation(s) for {:?}, {} collector(s) failed",
            collection.observations.len(),
            scope,
            collection.failures.len()
        );
        collection
    }
}
