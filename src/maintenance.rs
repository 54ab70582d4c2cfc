//! Log retention and size-based rotation for the server's log directory

use crate::error::MaintenanceError;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// A log file that was archived and truncated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedLog {
    pub original: PathBuf,
    pub archive: PathBuf,
    pub bytes: u64,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MaintenanceError + '_ {
    move |source| MaintenanceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Compressed archives written by `rotate_logs`; live logs never match
fn is_rotated_archive(name: &str) -> bool {
    name.contains(".log.") && name.ends_with(".gz")
}

/// Regular files directly inside `dir`; a missing directory yields nothing
fn regular_files(dir: &Path) -> Result<Vec<(PathBuf, fs::Metadata)>, MaintenanceError> {
    if dir.exists() && !dir.is_dir() {
        return Err(MaintenanceError::NotADirectory(dir.to_path_buf()));
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Log directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(io_err(dir)(e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(io_err(&path))?;
        if metadata.is_file() {
            files.push((path, metadata));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Delete rotated log archives in `dir` last modified more than `days` days before `now`
///
/// Only compressed archives are touched, so a live log is never removed however long it
/// has been idle. Subdirectories are ignored.
///
/// # Errors
///
/// Returns `MaintenanceError` if the directory cannot be listed or a file cannot be removed.
pub fn cleanup_logs(dir: &Path, days: u32, now: SystemTime) -> Result<Vec<PathBuf>, MaintenanceError> {
    let max_age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    let mut removed = Vec::new();

    for (path, metadata) in regular_files(dir)? {
        let is_archive = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_rotated_archive)
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        let modified = metadata.modified().map_err(io_err(&path))?;
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > max_age {
            fs::remove_file(&path).map_err(io_err(&path))?;
            debug!("Removed {} ({} day(s) old)", path.display(), age.as_secs() / 86_400);
            removed.push(path);
        }
    }

    info!("Removed {} log archive(s) older than {} day(s)", removed.len(), days);
    Ok(removed)
}

/// Archive name for `original` rotated at `now`
pub fn archive_path(original: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    original.with_file_name(format!("{}.{}.gz", name, now.format("%Y%m%d-%H%M%S")))
}

/// Rotate every live `.log` file in `dir` larger than `max_size_mb`
///
/// The live file is renamed aside and an empty file with the same permissions takes its
/// place before anything is compressed, so writers that open the path keep appending to a
/// fresh log. The renamed file is then gzipped and removed.
///
/// # Arguments
///
/// * `dir` - Directory holding the server's logs
/// * `max_size_mb` - Files larger than this are rotated
/// * `now` - Timestamp embedded in the archive names
///
/// # Errors
///
/// Returns `MaintenanceError` if a file cannot be renamed, recreated or archived. When
/// compression fails the renamed, uncompressed file is left in place.
pub fn rotate_logs(dir: &Path, max_size_mb: u64, now: DateTime<Utc>) -> Result<Vec<RotatedLog>, MaintenanceError> {
    rotate_larger_than(dir, max_size_mb.saturating_mul(BYTES_PER_MB), now)
}

fn rotate_larger_than(dir: &Path, max_bytes: u64, now: DateTime<Utc>) -> Result<Vec<RotatedLog>, MaintenanceError> {
    let mut rotated = Vec::new();

    for (path, metadata) in regular_files(dir)? {
        let live = path
            .extension()
            .map(|ext| ext == "log")
            .unwrap_or(false);
        if !live || metadata.len() <= max_bytes {
            continue;
        }

        let archive = archive_path(&path, now);
        let aside = archive.with_extension("");
        fs::rename(&path, &aside).map_err(io_err(&path))?;
        recreate_like(&path, &metadata)?;
        compress_into(&aside, &archive)?;
        fs::remove_file(&aside).map_err(io_err(&aside))?;

        let bytes = metadata.len();
        info!(
            "Rotated {} ({} bytes) to {}",
            path.display(),
            bytes,
            archive.display()
        );
        rotated.push(RotatedLog {
            original: path,
            archive,
            bytes,
        });
    }

    Ok(rotated)
}

/// Create an empty file at `path` with the mode and, when permitted, the owner of `previous`
fn recreate_like(path: &Path, previous: &fs::Metadata) -> Result<(), MaintenanceError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_err(path))?;
    fs::set_permissions(path, previous.permissions()).map_err(io_err(path))?;
    if let Err(e) = std::os::unix::fs::chown(path, Some(previous.uid()), Some(previous.gid())) {
        warn!("Could not restore the owner of {}: {}", path.display(), e);
    }
    Ok(())
}

fn compress_into(source: &Path, archive: &Path) -> Result<(), MaintenanceError> {
    let partial = archive.with_extension("gz.partial");
    let result = (|| -> io::Result<()> {
        let mut input = File::open(source)?;
        let mut encoder = GzEncoder::new(File::create(&partial)?, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.sync_all()?;
        fs::rename(&partial, archive)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&partial);
        io_err(archive)(e)
    })
}
