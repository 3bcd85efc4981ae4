//! On-disk encoding of encrypted objects.
//!
//! Every object has two raw streams under the repository root:
//!
//! - the **content stream**: a 40-byte plaintext header naming the object,
//!   followed by independently authenticated AES-256-GCM chunks;
//! - the **metadata stream**: one sealed record with mode, ownership,
//!   timestamps, link count and extended attributes.
//!
//! Directories store their entries as content, so names only ever reach the
//! disk encrypted.

mod content;
mod directory;
mod meta;

pub use content::{
    CHUNK_OVERHEAD, CHUNK_SIZE, ContentStream, HEADER_LEN, RAW_CHUNK_SIZE, raw_len_for_size,
};
pub use directory::{DirEntry, MAX_NAME_LEN, decode_entries, encode_entries};
pub use meta::{Metadata, open_metadata, seal_metadata};

use std::io;

use thiserror::Error;

use crate::id::FileId;

/// Length of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Length of an AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// The three kinds of encrypted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
}

impl FileKind {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            FileKind::RegularFile => 1,
            FileKind::Directory => 2,
            FileKind::Symlink => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FileKind::RegularFile),
            2 => Some(FileKind::Directory),
            3 => Some(FileKind::Symlink),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::RegularFile => libc::S_IFREG as u32,
            FileKind::Directory => libc::S_IFDIR as u32,
            FileKind::Symlink => libc::S_IFLNK as u32,
        }
    }
}

/// Errors produced while encoding or decoding encrypted streams.
///
/// # Security Classification
///
/// Variants marked `[INTEGRITY VIOLATION]` mean the stored bytes were altered,
/// truncated or swapped between objects. They are never repaired and never
/// turned into short reads.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A content chunk failed authentication.
    #[error("[INTEGRITY VIOLATION] chunk {chunk} of {id} failed authentication")]
    Integrity { id: FileId, chunk: u64 },

    /// The metadata record failed authentication.
    #[error("[INTEGRITY VIOLATION] metadata of {id} failed authentication")]
    MetaIntegrity { id: FileId },

    /// The content header is malformed or names another object.
    #[error("[INTEGRITY VIOLATION] invalid header for {id}: {reason}")]
    InvalidHeader { id: FileId, reason: String },

    /// Authenticated bytes did not parse as a record of the expected shape.
    #[error("[INTEGRITY VIOLATION] malformed record in {id}: {reason}")]
    Malformed { id: FileId, reason: String },

    /// Encryption failed unexpectedly.
    #[error("failed to encrypt data for {id}")]
    Encryption { id: FileId },

    /// Underlying raw stream I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether this error means stored data was tampered with or corrupted.
    pub fn is_integrity_violation(&self) -> bool {
        !matches!(self, CodecError::Io(_) | CodecError::Encryption { .. })
    }
}
