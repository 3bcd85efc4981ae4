//! Repository configuration persisted as `oxfs.json` in the repository root.

use std::io::Write;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{error, info};

use crate::codec::{CHUNK_SIZE, FileKind};
use crate::error::{FsError, FsResult};
use crate::id::FileId;
use crate::key::MasterKey;
use crate::storage::OsStorage;
use crate::table::FileTable;

/// Name of the config file in the repository root.
pub const CONFIG_FILE_NAME: &str = "oxfs.json";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Contents of `oxfs.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub format: u32,
    pub chunk_size: u64,
    /// Hex HMAC of a fixed label under the master key.
    pub key_check: String,
}

impl RepoConfig {
    /// Write a fresh config for `key`. Fails if one already exists.
    pub fn create(storage: &OsStorage, key: &MasterKey) -> FsResult<Self> {
        let config = Self {
            format: FORMAT_VERSION,
            chunk_size: CHUNK_SIZE,
            key_check: hex::encode(key.key_check()),
        };
        let json = serde_json::to_vec_pretty(&config)
            .map_err(|e| FsError::InvalidRepository(e.to_string()))?;
        let mut file = storage
            .open_stream(
                CONFIG_FILE_NAME,
                libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL,
                0o644,
            )
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(
                    storage.norm_path(CONFIG_FILE_NAME).display().to_string(),
                ),
                _ => FsError::StorageIo(e),
            })?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(config)
    }

    pub fn load(storage: &OsStorage) -> FsResult<Self> {
        let path = storage.norm_path(CONFIG_FILE_NAME);
        let raw = storage.read(CONFIG_FILE_NAME).map_err(|e| {
            FsError::InvalidRepository(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|e| {
            FsError::InvalidRepository(format!("malformed {}: {e}", path.display()))
        })?;
        if config.format != FORMAT_VERSION {
            return Err(FsError::InvalidRepository(format!(
                "unsupported format version {}",
                config.format
            )));
        }
        if config.chunk_size != CHUNK_SIZE {
            return Err(FsError::InvalidRepository(format!(
                "unsupported chunk size {}",
                config.chunk_size
            )));
        }
        Ok(config)
    }

    /// Check that `key` is the key this repository was created with.
    pub fn verify_key(&self, key: &MasterKey) -> FsResult<()> {
        let stored = hex::decode(&self.key_check)
            .map_err(|e| FsError::InvalidRepository(format!("bad key check: {e}")))?;
        if bool::from(stored.as_slice().ct_eq(&key.key_check()[..])) {
            Ok(())
        } else {
            error!("Master key does not match repository");
            Err(FsError::WrongKey)
        }
    }
}

/// Initialize an empty repository in `storage`'s root: config plus the root
/// directory object, owned by the calling user.
pub fn init_repository(storage: &OsStorage, key: &MasterKey) -> FsResult<RepoConfig> {
    storage.create_dir_all("")?;
    let config = RepoConfig::create(storage, key)?;

    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let table = FileTable::new(storage.clone(), key.clone());
    let root = table.create_as(FileId::root(), FileKind::Directory, 0o755, uid, gid)?;
    table.close(&root)?;

    info!(root = %storage.root().display(), "Initialized repository");
    Ok(config)
}
