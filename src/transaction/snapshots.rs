//! Compressed, append-only snapshots of the configuration document

use crate::error::TransactionError;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "Caddyfile.";
const GZ_SUFFIX: &str = ".gz";
const ID_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";

/// One stored snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub created: DateTime<Utc>,
    pub path: PathBuf,
    pub size: u64,
}

impl Snapshot {
    pub fn is_compressed(&self) -> bool {
        self.path.to_string_lossy().ends_with(GZ_SUFFIX)
    }
}

/// Which snapshots survive a prune
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetentionPolicy {
    /// Drop snapshots older than this
    pub max_age: Option<ChronoDuration>,
    /// Keep at most this many of the newest snapshots
    pub keep: Option<usize>,
}

impl RetentionPolicy {
    pub fn max_age_days(days: u32) -> Self {
        Self {
            max_age: Some(ChronoDuration::days(i64::from(days))),
            keep: None,
        }
    }

    pub fn keep_newest(keep: usize) -> Self {
        Self {
            max_age: None,
            keep: Some(keep),
        }
    }
}

/// Format a snapshot id from its creation time
pub fn format_id(created: DateTime<Utc>) -> String {
    created.format(ID_FORMAT).to_string()
}

/// Parse a snapshot id back into its creation time
pub fn parse_id(id: &str) -> Option<DateTime<Utc>> {
    if id.len() != 22 || id.as_bytes()[15] != b'-' {
        return None;
    }
    let seconds = NaiveDateTime::parse_from_str(id.get(..15)?, "%Y%m%d-%H%M%S").ok()?;
    let micros_text = id.get(16..)?;
    if !micros_text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let micros: u32 = micros_text.parse().ok()?;
    seconds
        .with_nanosecond(micros * 1000)
        .map(|naive| naive.and_utc())
}

/// Creation time for a new snapshot, strictly after `latest`
fn next_timestamp(now: DateTime<Utc>, latest: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now
        .with_nanosecond(now.nanosecond() / 1000 * 1000)
        .unwrap_or(now);
    match latest {
        Some(latest) if now <= latest => latest + ChronoDuration::microseconds(1),
        _ => now,
    }
}

fn id_from_file_name(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(FILE_PREFIX)?;
    let id = rest.strip_suffix(GZ_SUFFIX).unwrap_or(rest);
    parse_id(id).map(|_| id)
}

/// Snapshot directory
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `content` as a new gzip snapshot and return it
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IoFailure` if the directory or file cannot be written.
    pub fn create(&self, content: &[u8]) -> Result<Snapshot, TransactionError> {
        fs::create_dir_all(&self.dir).map_err(|e| TransactionError::io(&self.dir, e))?;

        let latest = self.latest()?.map(|snapshot| snapshot.created);
        let created = next_timestamp(Utc::now(), latest);
        let id = format_id(created);
        let path = self.dir.join(format!("{}{}{}", FILE_PREFIX, id, GZ_SUFFIX));
        let partial = self.dir.join(format!(".{}{}{}.partial", FILE_PREFIX, id, GZ_SUFFIX));

        let write = || -> std::io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&partial)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(content)?;
            let file = encoder.finish()?;
            file.sync_all()?;
            fs::rename(&partial, &path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&partial);
            return Err(TransactionError::io(&path, e));
        }

        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!("Created snapshot {} ({} bytes compressed)", id, size);
        Ok(Snapshot {
            id,
            created,
            path,
            size,
        })
    }

    /// All snapshots, newest first
    ///
    /// A missing directory means no snapshots yet.
    pub fn list(&self) -> Result<Vec<Snapshot>, TransactionError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TransactionError::io(&self.dir, e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TransactionError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = id_from_file_name(name) else {
                continue;
            };
            let Some(created) = parse_id(id) else { continue };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            snapshots.push(Snapshot {
                id: id.to_string(),
                created,
                path: entry.path(),
                size,
            });
        }
        snapshots.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(snapshots)
    }

    pub fn latest(&self) -> Result<Option<Snapshot>, TransactionError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Look up a snapshot by id; `latest` selects the newest one
    pub fn find(&self, id: &str) -> Result<Snapshot, TransactionError> {
        let snapshots = self.list()?;
        let found = if id == "latest" {
            snapshots.into_iter().next()
        } else {
            snapshots.into_iter().find(|s| s.id == id)
        };
        found.ok_or_else(|| TransactionError::NotFound(format!("snapshot {}", id)))
    }

    /// Snapshot content, decompressed when stored as gzip
    pub fn read(&self, snapshot: &Snapshot) -> Result<Vec<u8>, TransactionError> {
        let raw = fs::read(&snapshot.path).map_err(|e| TransactionError::io(&snapshot.path, e))?;
        if !snapshot.is_compressed() {
            return Ok(raw);
        }
        let mut content = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut content)
            .map_err(|e| TransactionError::io(&snapshot.path, e))?;
        Ok(content)
    }

    /// Delete the snapshots `policy` does not keep, returning the removed ones
    pub fn prune(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, TransactionError> {
        let mut removed = Vec::new();
        for (index, snapshot) in self.list()?.into_iter().enumerate() {
            let too_old = policy
                .max_age
                .map(|age| now - snapshot.created > age)
                .unwrap_or(false);
            let over_count = policy.keep.map(|keep| index >= keep).unwrap_or(false);
            if !(too_old || over_count) {
                continue;
            }
            match fs::remove_file(&snapshot.path) {
                Ok(()) => {
                    debug!("Pruned snapshot {}", snapshot.id);
                    removed.push(snapshot);
                }
                Err(e) => {
                    warn!("Failed to remove snapshot {}: {}", snapshot.path.display(), e);
                    return Err(TransactionError::io(&snapshot.path, e));
                }
            }
        }
        if !removed.is_empty() {
            info!("Pruned {} snapshot(s)", removed.len());
        }
        Ok(removed)
    }
}
