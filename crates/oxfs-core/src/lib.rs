//! Core of the oxfs encrypted overlay filesystem.
//!
//! Content, metadata and file names are stored encrypted beneath a plain
//! host directory (the repository). This crate owns the on-disk format, the
//! open-file identity cache ([`FileTable`]) and the repository lock
//! ([`RepoLocker`]). Path-based operations live in `oxfs-fuse`.

pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod key;
pub mod lock;
pub mod node;
pub mod storage;
pub mod table;

pub use codec::{CodecError, DirEntry, FileKind, Metadata};
pub use config::{CONFIG_FILE_NAME, RepoConfig, init_repository};
pub use error::{FsError, FsResult};
pub use id::FileId;
pub use key::MasterKey;
pub use lock::{LOCK_FILE_NAME, RepoLocker};
pub use node::{FileNode, NodeStat, NodeState, XattrMode, fold_name};
pub use storage::{OsStorage, StorageStats};
pub use table::{FileTable, NodeRef};

/// Names in the repository root that belong to the implementation.
pub const RESERVED_ROOT_NAMES: &[&str] = &[LOCK_FILE_NAME, CONFIG_FILE_NAME];
