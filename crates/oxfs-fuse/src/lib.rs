//! FUSE mount for oxfs repositories.
//!
//! Two layers:
//!
//! - [`FuseHighLevelOps`]: path-addressed filesystem operations over the
//!   core file table, returning typed results. Usable without a kernel.
//! - [`OxFs`]: the `fuser::Filesystem` adapter that maps inodes to paths
//!   and replies to the kernel.
//!
//! # Usage
//!
//! ```ignore
//! use oxfs_fuse::{FuseHighLevelOps, MountConfig, OxFs};
//!
//! let ops = Arc::new(FuseHighLevelOps::new(table, MountConfig::default()));
//! fuser::mount2(OxFs::new(ops), mountpoint, &options)?;
//! ```

pub mod attr;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod ops;

pub use attr::{FileStat, OwnerOverride, postprocess_stat};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult, ToErrno};
pub use filesystem::OxFs;
pub use handles::{HandleTable, OpenFile};
pub use inode::{InodeTable, ROOT_INODE};
pub use ops::{DirListing, FuseHighLevelOps};
