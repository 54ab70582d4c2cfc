use crate::command::run_with_timeout;
use crate::error::{CollectorError, ControlError};
use crate::events::{metrics, Observation};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const CERT_EXTENSIONS: [&str; 2] = ["crt", "pem"];
const WEAK_SIGNATURES: [&str; 2] = ["sha1", "md5"];
const MIN_RSA_BITS: u32 = 2048;

/// Metadata extracted from `openssl x509 -noout -enddate -subject -text`
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateInfo {
    pub path: PathBuf,
    pub subject: String,
    pub not_after: DateTime<Utc>,
    pub signature_algorithm: Option<String>,
    pub public_key_algorithm: Option<String>,
    pub key_bits: Option<u32>,
}

impl CertificateInfo {
    /// Whole days until expiry, negative once expired
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Signed with SHA-1 or MD5
    pub fn weak_signature(&self) -> bool {
        self.signature_algorithm
            .as_deref()
            .map(|alg| {
                let alg = alg.to_ascii_lowercase();
                WEAK_SIGNATURES.iter().any(|weak| alg.contains(weak))
            })
            .unwrap_or(false)
    }

    /// RSA key shorter than 2048 bits
    pub fn short_key(&self) -> bool {
        let is_rsa = self
            .public_key_algorithm
            .as_deref()
            .map(|alg| alg.to_ascii_lowercase().contains("rsa"))
            .unwrap_or(false);
        is_rsa && self.key_bits.map(|bits| bits < MIN_RSA_BITS).unwrap_or(false)
    }

    /// Common name from the subject, or the file name when there is none
    pub fn label(&self) -> String {
        common_name(&self.subject).unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        })
    }

    pub fn observations(&self, now: DateTime<Utc>) -> Vec<Observation> {
        let source = self.label();
        let flag = |set: bool| if set { 1.0 } else { 0.0 };
        vec![
            Observation::new(metrics::CERT_DAYS_LEFT, self.days_left(now) as f64, &source),
            Observation::new(metrics::CERT_WEAK_SIGNATURE, flag(self.weak_signature()), &source),
            Observation::new(metrics::CERT_SHORT_KEY, flag(self.short_key()), &source),
        ]
    }
}

fn common_name(subject: &str) -> Option<String> {
    subject
        .split([',', '/'])
        .filter_map(|part| part.split_once('='))
        .find(|(key, _)| key.trim() == "CN")
        .map(|(_, value)| value.trim().to_string())
        .filter(|cn| !cn.is_empty())
}

/// Parse the text printed by `openssl x509 -noout -enddate -subject -text`
///
/// # Errors
///
/// Returns `CollectorError::ParseError` when there is no parseable `notAfter=` line.
pub fn parse_openssl_output(path: &Path, output: &str) -> Result<CertificateInfo, CollectorError> {
    let mut not_after = None;
    let mut subject = String::new();
    let mut signature_algorithm = None;
    let mut public_key_algorithm = None;
    let mut key_bits = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(date) = line.strip_prefix("notAfter=") {
            not_after = Some(parse_openssl_date(date)?);
        } else if let Some(value) = line.strip_prefix("subject=") {
            subject = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("Signature Algorithm:") {
            signature_algorithm.get_or_insert_with(|| value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Public Key Algorithm:") {
            public_key_algorithm.get_or_insert_with(|| value.trim().to_string());
        } else if line.contains("Public-Key:") && key_bits.is_none() {
            key_bits = parse_key_bits(line);
        }
    }

    let not_after = not_after.ok_or_else(|| {
        CollectorError::ParseError(format!("no notAfter date for {}", path.display()))
    })?;
    Ok(CertificateInfo {
        path: path.to_path_buf(),
        subject,
        not_after,
        signature_algorithm,
        public_key_algorithm,
        key_bits,
    })
}

/// `Mar  9 12:00:00 2025 GMT`
fn parse_openssl_date(text: &str) -> Result<DateTime<Utc>, CollectorError> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .map(|naive| naive.and_utc())
        .map_err(|e| CollectorError::ParseError(format!("bad certificate date '{}': {}", text, e)))
}

/// `RSA Public-Key: (2048 bit)` or `Public-Key: (256 bit)`
fn parse_key_bits(line: &str) -> Option<u32> {
    let open = line.find('(')?;
    let inside = &line[open + 1..];
    inside.split_whitespace().next()?.parse().ok()
}

fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CERT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Sort the entries of `dir` into subdirectories to descend into and certificate files
fn scan_dir(dir: &Path, pending: &mut Vec<PathBuf>, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            pending.push(path);
        } else if file_type.is_symlink() && path.is_dir() {
            debug!("Not following symlinked directory {}", path.display());
        } else if is_certificate_file(&path) {
            found.push(path);
        }
    }
    Ok(())
}

/// Certificate files under `dir`, recursively, sorted by path
///
/// Symlinked directories are not followed. A subdirectory that cannot be read is logged and
/// skipped.
///
/// # Errors
///
/// Returns `CollectorError::IoError` when `dir` itself cannot be read.
pub fn find_certificates(dir: &Path) -> Result<Vec<PathBuf>, CollectorError> {
    let mut found = Vec::new();
    let mut pending = Vec::new();
    scan_dir(dir, &mut pending, &mut found)?;
    while let Some(current) = pending.pop() {
        if let Err(e) = scan_dir(&current, &mut pending, &mut found) {
            warn!("Skipping unreadable directory {}: {}", current.display(), e);
        }
    }
    found.sort();
    Ok(found)
}

/// Reads certificate metadata from the server's certificate store
pub struct CertCollector {
    dir: PathBuf,
    openssl: String,
    timeout: Duration,
}

impl CertCollector {
    /// # Arguments
    ///
    /// * `dir` - Root of the certificate store, searched recursively
    /// * `timeout` - Limit for each `openssl` invocation
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            openssl: "openssl".to_string(),
            timeout,
        }
    }

    /// Inspect one certificate file
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::Timeout` when `openssl` does not finish in time,
    /// `CollectorError::SubprocessSpawn` when it cannot be started and
    /// `CollectorError::ParseError` when it rejects the file or prints no expiry date.
    pub fn inspect(&self, path: &Path) -> Result<CertificateInfo, CollectorError> {
        let mut command = Command::new(&self.openssl);
        command
            .args(["x509", "-in"])
            .arg(path)
            .args(["-noout", "-enddate", "-subject", "-text"]);
        let output = run_with_timeout(&mut command, self.timeout).map_err(|e| match e {
            ControlError::Timeout { timeout, .. } => CollectorError::Timeout(timeout),
            other => CollectorError::SubprocessSpawn(other.to_string()),
        })?;
        if !output.status.success() {
            return Err(CollectorError::ParseError(format!(
                "openssl rejected {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_openssl_output(path, &String::from_utf8_lossy(&output.stdout))
    }

    /// Observations for every readable certificate, optionally only those matching `domain`
    ///
    /// A missing store yields no observations. Unreadable files are logged and skipped.
    ///
    /// # Arguments
    ///
    /// * `domain` - Keep only certificates whose label matches, case-insensitively
    /// * `now` - Reference time for `cert_days_left`
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::IoError` when the store exists but cannot be listed.
    pub fn collect(&self, domain: Option<&str>, now: DateTime<Utc>) -> Result<Vec<Observation>, CollectorError> {
        if !self.dir.exists() {
            warn!("Certificate store {} does not exist", self.dir.display());
            return Ok(Vec::new());
        }

        let mut observations = Vec::new();
        let files = find_certificates(&self.dir)?;
        info!("Inspecting {} certificate file(s)", files.len());
        for path in files {
            match self.inspect(&path) {
                Ok(cert) => {
                    if let Some(domain) = domain {
                        if !cert.label().eq_ignore_ascii_case(domain) {
                            continue;
                        }
                    }
                    debug!("{} expires {}", cert.label(), cert.not_after);
                    observations.extend(cert.observations(now));
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(observations)
    }
}
