use crate::error::TransactionError;
use log::debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on the configuration, released on drop
///
/// Guards against a second warden process mutating the document concurrently.
#[derive(Debug)]
pub struct ConfigLock {
    file: File,
    path: PathBuf,
}

impl ConfigLock {
    /// Block until the exclusive lock on `path` is held
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::IoFailure` if the lock file cannot be opened or locked.
    pub fn acquire(path: &Path) -> Result<Self, TransactionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| TransactionError::io(path, e))?;

        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(TransactionError::io(path, err));
            }
        }

        debug!("Acquired config lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, TransactionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| TransactionError::io(path, e))?;

        // SAFETY: as in `acquire`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            }));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(TransactionError::io(path, err))
        }
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; closing it would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!("Released config lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Caddyfile.lock");

        let held = ConfigLock::acquire(&path).unwrap();
        assert!(ConfigLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(ConfigLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_unwritable_lock_path_is_io_failure() {
        let result = ConfigLock::acquire(Path::new("/nonexistent-dir/Caddyfile.lock"));
        assert!(matches!(result, Err(TransactionError::IoFailure { .. })));
    }
}
