//! Attributes as presented to the kernel, after owner overrides.

use std::time::SystemTime;

use fuser::{FileAttr, FileType};
use oxfs_core::{FileKind, NodeStat};

/// Block size reported in `st_blksize`.
pub const BLOCK_SIZE: u32 = 4096;

const DEFAULT_DIR_PERM: u16 = 0o755;
const DEFAULT_FILE_PERM: u16 = 0o644;
const DEFAULT_LINK_PERM: u16 = 0o777;

/// Presentation-only substitution of reported ownership.
///
/// Nothing here is persisted; stored uid/gid and mode are untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerOverride {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Report fixed default permissions instead of the stored ones.
    pub hide_permissions: bool,
}

impl OwnerOverride {
    pub fn is_active(&self) -> bool {
        self.uid.is_some() || self.gid.is_some() || self.hide_permissions
    }
}

/// Attribute snapshot in the shape the kernel wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl From<&NodeStat> for FileStat {
    fn from(stat: &NodeStat) -> Self {
        Self {
            kind: stat.kind,
            size: stat.size,
            blocks: stat.blocks,
            perm: u16::try_from(stat.mode & 0o7777).unwrap_or(0),
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
        }
    }
}

impl FileStat {
    pub fn to_file_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: file_type(self.kind),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Apply the owner override to a stat result.
pub fn postprocess_stat(stat: &mut FileStat, over: &OwnerOverride) {
    if let Some(uid) = over.uid {
        stat.uid = uid;
    }
    if let Some(gid) = over.gid {
        stat.gid = gid;
    }
    if over.hide_permissions {
        stat.perm = match stat.kind {
            FileKind::Directory => DEFAULT_DIR_PERM,
            FileKind::RegularFile => DEFAULT_FILE_PERM,
            FileKind::Symlink => DEFAULT_LINK_PERM,
        };
    }
}

pub fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxfs_core::FileId;

    fn sample(kind: FileKind) -> FileStat {
        let now = SystemTime::now();
        FileStat::from(&NodeStat {
            id: FileId::random(),
            kind,
            size: 10,
            blocks: 1,
            mode: kind.type_bits() | 0o600,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
        })
    }

    #[test]
    fn test_no_override_keeps_stored_values() {
        let mut stat = sample(FileKind::RegularFile);
        postprocess_stat(&mut stat, &OwnerOverride::default());
        assert_eq!((stat.uid, stat.gid, stat.perm), (1000, 1000, 0o600));
    }

    #[test]
    fn test_override_substitutes_ids_only() {
        let mut stat = sample(FileKind::RegularFile);
        let over = OwnerOverride {
            uid: Some(0),
            gid: None,
            hide_permissions: false,
        };
        postprocess_stat(&mut stat, &over);
        assert_eq!((stat.uid, stat.gid, stat.perm), (0, 1000, 0o600));
    }

    #[test]
    fn test_hidden_permissions_use_defaults() {
        let over = OwnerOverride {
            hide_permissions: true,
            ..Default::default()
        };
        let mut dir = sample(FileKind::Directory);
        postprocess_stat(&mut dir, &over);
        assert_eq!(dir.perm, 0o755);
        let mut link = sample(FileKind::Symlink);
        postprocess_stat(&mut link, &over);
        assert_eq!(link.perm, 0o777);
    }

    #[test]
    fn test_file_attr_kind() {
        let attr = sample(FileKind::Directory).to_file_attr(9);
        assert_eq!(attr.ino, 9);
        assert_eq!(attr.kind, FileType::Directory);
    }
}
