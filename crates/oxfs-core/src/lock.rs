//! Repository-wide exclusive lock.
//!
//! A read-write mount creates `.oxfs.lock` in the repository root with
//! `O_CREAT | O_EXCL` and keeps it open until release. A second read-write
//! mount of the same repository fails with [`FsError::RepositoryBusy`].
//! Read-only mounts take no lock and may coexist with anything.
//!
//! The marker is not removed after a crash. A stale marker is reported to
//! the operator (it holds the PID of the last owner) rather than healed.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::error::{FsError, FsResult};
use crate::storage::OsStorage;

/// Reserved name of the lock marker in the repository root.
pub const LOCK_FILE_NAME: &str = ".oxfs.lock";

/// Owner of the repository lock for the lifetime of a mount.
///
/// Dropping the locker releases it, so every exit path (including a failed
/// startup) cleans up the marker.
#[derive(Debug)]
pub struct RepoLocker {
    storage: OsStorage,
    held: Option<File>,
}

impl RepoLocker {
    /// Acquire the lock unless `read_only`.
    pub fn acquire(storage: &OsStorage, read_only: bool) -> FsResult<Self> {
        if read_only {
            debug!(root = %storage.root().display(), "Read-only mount, not locking");
            return Ok(Self {
                storage: storage.clone(),
                held: None,
            });
        }

        let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
        let mut file = match storage.open_stream(LOCK_FILE_NAME, flags, 0o644) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let path = storage.norm_path(LOCK_FILE_NAME);
                error!(
                    path = %path.display(),
                    holder = %read_holder(storage).unwrap_or_else(|| "unknown".to_string()),
                    "Repository appears to be mounted by another process; \
                     remove the lock file if that process is gone"
                );
                return Err(FsError::RepositoryBusy { path, source: e });
            }
            Err(e) => return Err(FsError::StorageIo(e)),
        };

        // Best effort; the marker's existence is what counts.
        if let Err(e) = writeln!(file, "{}", std::process::id()).and_then(|()| file.sync_all()) {
            warn!(error = %e, "Failed to record PID in lock file");
        }
        info!(path = %storage.norm_path(LOCK_FILE_NAME).display(), "Acquired repository lock");
        Ok(Self {
            storage: storage.clone(),
            held: Some(file),
        })
    }

    /// Whether this locker currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    /// Host path of the marker.
    pub fn marker_path(&self) -> PathBuf {
        self.storage.norm_path(LOCK_FILE_NAME)
    }

    /// Close and remove the marker. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(file) = self.held.take() {
            drop(file);
            self.storage.remove_file_nothrow(LOCK_FILE_NAME);
            info!(path = %self.marker_path().display(), "Released repository lock");
        }
    }
}

impl Drop for RepoLocker {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_holder(storage: &OsStorage) -> Option<String> {
    let raw = storage.read(LOCK_FILE_NAME).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let pid = text.trim();
    (!pid.is_empty()).then(|| pid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_writer_is_busy() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());

        let first = RepoLocker::acquire(&storage, false).unwrap();
        assert!(first.is_locked());
        let err = RepoLocker::acquire(&storage, false).unwrap_err();
        assert!(matches!(err, FsError::RepositoryBusy { .. }));
    }

    #[test]
    fn read_only_never_contends() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());

        let _writer = RepoLocker::acquire(&storage, false).unwrap();
        let reader = RepoLocker::acquire(&storage, true).unwrap();
        assert!(!reader.is_locked());
    }

    #[test]
    fn release_is_idempotent_and_frees_the_repository() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());

        let mut lock = RepoLocker::acquire(&storage, false).unwrap();
        assert!(storage.exists(LOCK_FILE_NAME));
        lock.release();
        lock.release();
        assert!(!lock.is_locked());
        assert!(!storage.exists(LOCK_FILE_NAME));

        let again = RepoLocker::acquire(&storage, false).unwrap();
        drop(again);
        assert!(!storage.exists(LOCK_FILE_NAME));
    }

    #[test]
    fn marker_records_pid() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());
        let _lock = RepoLocker::acquire(&storage, false).unwrap();
        assert_eq!(read_holder(&storage), Some(std::process::id().to_string()));
    }

    #[test]
    fn stale_marker_blocks_until_removed() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());
        std::fs::write(dir.path().join(LOCK_FILE_NAME), b"99999\n").unwrap();

        assert!(RepoLocker::acquire(&storage, false).is_err());
        std::fs::remove_file(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert!(RepoLocker::acquire(&storage, false).is_ok());
    }
}
