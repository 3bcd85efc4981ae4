//! Error handling and errno mapping for the FUSE layer.
//!
//! Path-resolution failures keep their POSIX meaning. Integrity violations
//! and raw storage failures both reach the kernel as `EIO`, but are logged
//! differently before they get there.

use std::io;

use oxfs_core::FsError;
use thiserror::Error;
use tracing::error;

/// Errors returned by path-based operations.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Repository operation failed (boxed to keep the enum small).
    #[error("{0}")]
    Fs(Box<FsError>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Unknown or already released file handle.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Unknown inode.
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    /// Path is not valid UTF-8 or is not absolute.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Operation not supported")]
    NotSupported,
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Fs(e) => fs_error_to_errno(e),
            FuseError::Io(e) => io_error_to_errno(e),
            FuseError::InvalidHandle(_) => libc::EBADF,
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidPath(_) => libc::EINVAL,
            FuseError::NotSupported => libc::ENOTSUP,
        }
    }

    /// Whether this error is a tampered-data report.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, FuseError::Fs(e) if e.is_integrity_violation())
    }
}

impl From<FsError> for FuseError {
    fn from(e: FsError) -> Self {
        FuseError::Fs(Box::new(e))
    }
}

/// Result type for FUSE operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    fn to_errno(&self) -> i32;
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> i32 {
        FuseError::to_errno(self)
    }
}

impl ToErrno for FsError {
    fn to_errno(&self) -> i32 {
        fs_error_to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

/// The OS error code carried by `e`, or `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Map a repository error to errno.
pub fn fs_error_to_errno(e: &FsError) -> i32 {
    match e {
        FsError::RepositoryBusy { .. } => libc::EBUSY,
        FsError::NotFound(_) => libc::ENOENT,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::NotEmpty(_) => libc::ENOTEMPTY,
        FsError::NotADirectory(_) => libc::ENOTDIR,
        FsError::IsADirectory(_) => libc::EISDIR,
        FsError::InvalidArgument(_) => libc::EINVAL,
        FsError::NameTooLong(_) => libc::ENAMETOOLONG,
        FsError::NotPermitted(_) => libc::EPERM,
        FsError::NoAttribute(_) => no_attribute_errno(),
        FsError::ReadOnly => libc::EROFS,
        FsError::WrongKey => libc::EACCES,
        FsError::InvalidRepository(_) | FsError::InvariantViolation(_) => libc::EIO,
        FsError::Integrity { id, source } => {
            error!(id = %id, error = %source, "Integrity violation reported as EIO");
            libc::EIO
        }
        FsError::StorageIo(io) => io_error_to_errno(io),
    }
}

#[cfg(target_os = "linux")]
fn no_attribute_errno() -> i32 {
    libc::ENODATA
}

#[cfg(not(target_os = "linux"))]
fn no_attribute_errno() -> i32 {
    libc::ENOATTR
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxfs_core::{CodecError, FileId};

    #[test]
    fn test_io_error_mapping() {
        let e = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(io_error_to_errno(&e), libc::ENOSPC);

        let e = io::Error::other("custom error");
        assert_eq!(io_error_to_errno(&e), libc::EIO);
    }

    #[test]
    fn test_resolution_errors_keep_posix_meaning() {
        let cases = [
            (FsError::NotFound("a".into()), libc::ENOENT),
            (FsError::AlreadyExists("a".into()), libc::EEXIST),
            (FsError::NotEmpty("a".into()), libc::ENOTEMPTY),
            (FsError::NotADirectory("a".into()), libc::ENOTDIR),
            (FsError::IsADirectory("a".into()), libc::EISDIR),
            (FsError::NameTooLong("a".into()), libc::ENAMETOOLONG),
            (FsError::ReadOnly, libc::EROFS),
        ];
        for (err, errno) in cases {
            assert_eq!(FuseError::from(err).to_errno(), errno);
        }
    }

    #[test]
    fn test_integrity_is_eio_but_distinguishable() {
        let id = FileId::random();
        let err = FuseError::from(FsError::Integrity {
            id,
            source: CodecError::Integrity { id, chunk: 0 },
        });
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.is_integrity_violation());

        let storage = FuseError::from(FsError::StorageIo(io::Error::other("disk")));
        assert_eq!(storage.to_errno(), libc::EIO);
        assert!(!storage.is_integrity_violation());
    }

    #[test]
    fn test_handle_errors() {
        assert_eq!(FuseError::InvalidHandle(7).to_errno(), libc::EBADF);
        assert!(FuseError::InvalidHandle(7).to_string().contains('7'));
    }
}
