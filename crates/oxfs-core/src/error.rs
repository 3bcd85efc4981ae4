//! Error taxonomy for repository operations.
//!
//! Path-resolution outcomes (`NotFound`, `AlreadyExists`, ...) map to the
//! matching POSIX status. Integrity and storage failures both surface as I/O
//! errors to callers, but stay distinct here so they can be logged and
//! counted separately.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::id::FileId;

#[derive(Error, Debug)]
pub enum FsError {
    /// Another process holds the repository lock. Fatal to mount.
    #[error("repository is locked by another process (lock file {path:?})")]
    RepositoryBusy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// Requested extended attribute does not exist.
    #[error("no such attribute: {0}")]
    NoAttribute(String),

    /// Mutation attempted on a read-only mount.
    #[error("repository is mounted read-only")]
    ReadOnly,

    /// The master key does not match the repository.
    #[error("master key does not match this repository")]
    WrongKey,

    /// The repository root is missing its config or the config is unreadable.
    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    /// **[INTEGRITY VIOLATION]** stored data failed authentication.
    #[error("integrity violation in {id}: {source}")]
    Integrity {
        id: FileId,
        #[source]
        source: CodecError,
    },

    /// Underlying raw storage failed.
    #[error("storage I/O error: {0}")]
    StorageIo(#[source] io::Error),

    /// Internal consistency fault, e.g. two live nodes for one identifier.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl FsError {
    /// Whether this error reports tampered or corrupted stored data.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, FsError::Integrity { .. })
    }

    pub(crate) fn from_codec(id: FileId, err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => FsError::StorageIo(e),
            CodecError::Encryption { .. } => {
                FsError::StorageIo(io::Error::other(err.to_string()))
            }
            other => FsError::Integrity { id, source: other },
        }
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::StorageIo(e)
    }
}

impl From<CodecError> for FsError {
    fn from(err: CodecError) -> Self {
        let id = match &err {
            CodecError::Integrity { id, .. }
            | CodecError::MetaIntegrity { id }
            | CodecError::InvalidHeader { id, .. }
            | CodecError::Malformed { id, .. }
            | CodecError::Encryption { id } => *id,
            CodecError::Io(_) => FileId::root(),
        };
        FsError::from_codec(id, err)
    }
}

/// Result type for repository operations.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_integrity_errors_stay_integrity() {
        let id = FileId::random();
        let err: FsError = CodecError::Integrity { id, chunk: 3 }.into();
        assert!(err.is_integrity_violation());
        assert!(err.to_string().contains("chunk 3"));
    }

    #[test]
    fn codec_io_errors_become_storage_errors() {
        let err: FsError = CodecError::Io(io::Error::from_raw_os_error(libc::ENOSPC)).into();
        assert!(!err.is_integrity_violation());
        match err {
            FsError::StorageIo(e) => assert_eq!(e.raw_os_error(), Some(libc::ENOSPC)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
