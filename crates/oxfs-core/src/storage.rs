//! Raw access to the host directory beneath the repository root.
//!
//! Every path handed to [`OsStorage`] is relative to the root. Failures are
//! plain `io::Error`s carrying the OS error code; retry policy, if any, is
//! the host filesystem's business.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Filesystem usage figures for the volume holding the repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
}

/// The owning-storage service rooted at a repository directory.
#[derive(Debug, Clone)]
pub struct OsStorage {
    root: PathBuf,
}

impl OsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute host path of a relative name, for diagnostics.
    pub fn norm_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    /// Open a raw byte stream with POSIX-style `flags` and permission `mode`.
    ///
    /// Honors the access mode plus `O_CREAT`, `O_EXCL`, `O_TRUNC` and
    /// `O_APPEND`; other flags are passed through as custom flags.
    pub fn open_stream(&self, name: impl AsRef<Path>, flags: i32, mode: u32) -> io::Result<File> {
        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => options.read(true),
            libc::O_WRONLY => options.write(true),
            _ => options.read(true).write(true),
        };
        if flags & libc::O_CREAT != 0 {
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
            // std refuses create without write access; the marker file is
            // opened O_RDONLY|O_CREAT|O_EXCL, so grant write for creation.
            if flags & libc::O_ACCMODE == libc::O_RDONLY {
                options.write(true);
            }
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        if flags & libc::O_APPEND != 0 {
            options.append(true);
        }
        let passthrough =
            flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND);
        options.custom_flags(passthrough).mode(mode);
        options.open(self.root.join(name))
    }

    /// Create `name` and all missing parents as directories.
    pub fn create_dir_all(&self, name: impl AsRef<Path>) -> io::Result<()> {
        fs::create_dir_all(self.root.join(name))
    }

    pub fn remove_file(&self, name: impl AsRef<Path>) -> io::Result<()> {
        fs::remove_file(self.root.join(name))
    }

    /// Remove a file, logging instead of failing. Missing files are fine.
    pub fn remove_file_nothrow(&self, name: impl AsRef<Path>) {
        let path = self.root.join(name);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed raw file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove raw file"),
        }
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
        fs::rename(self.root.join(from), self.root.join(to))
    }

    pub fn exists(&self, name: impl AsRef<Path>) -> bool {
        self.root.join(name).exists()
    }

    pub fn read(&self, name: impl AsRef<Path>) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(name))
    }

    /// Usage figures of the volume holding the root.
    pub fn statvfs(&self) -> io::Result<StorageStats> {
        let stat = nix_statvfs(&self.root)?;
        Ok(stat)
    }
}

fn nix_statvfs(path: &Path) -> io::Result<StorageStats> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut buf = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: c_path is a valid NUL-terminated string and buf is writable.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned success, so buf is initialized.
    let st = unsafe { buf.assume_init() };
    #[allow(clippy::useless_conversion, clippy::cast_possible_truncation)]
    Ok(StorageStats {
        blocks: u64::from(st.f_blocks),
        blocks_free: u64::from(st.f_bfree),
        blocks_available: u64::from(st.f_bavail),
        files: u64::from(st.f_files),
        files_free: u64::from(st.f_ffree),
        block_size: st.f_frsize as u32,
        name_max: st.f_namemax as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn exclusive_create_fails_when_present() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());
        let flags = libc::O_RDONLY | libc::O_CREAT | libc::O_EXCL;
        storage.open_stream("marker", flags, 0o644).unwrap();
        let err = storage.open_stream("marker", flags, 0o644).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn read_write_stream_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());
        storage.create_dir_all("ab").unwrap();
        let mut f = storage
            .open_stream("ab/cd", libc::O_RDWR | libc::O_CREAT, 0o600)
            .unwrap();
        f.write_all(b"raw").unwrap();
        assert_eq!(storage.read("ab/cd").unwrap(), b"raw");

        storage.rename("ab/cd", "ab/ef").unwrap();
        assert!(!storage.exists("ab/cd"));
        storage.remove_file("ab/ef").unwrap();
        // Removing twice is quiet.
        storage.remove_file_nothrow("ab/ef");
    }

    #[test]
    fn missing_file_reports_os_code() {
        let dir = TempDir::new().unwrap();
        let storage = OsStorage::new(dir.path());
        let err = storage.open_stream("nope", libc::O_RDONLY, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn statvfs_reports_block_size() {
        let dir = TempDir::new().unwrap();
        let stats = OsStorage::new(dir.path()).statvfs().unwrap();
        assert!(stats.block_size > 0);
    }
}
