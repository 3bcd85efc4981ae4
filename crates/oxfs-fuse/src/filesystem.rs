//! `fuser::Filesystem` adapter.
//!
//! Translates the kernel's inode-addressed requests into the path-based
//! calls of [`FuseHighLevelOps`]. The only state kept here is the inode
//! table; everything else lives in the operations layer.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use oxfs_core::XattrMode;
use tracing::{debug, error, info, trace};

use crate::attr::{FileStat, file_type};
use crate::error::{FuseError, FuseResult};
use crate::inode::{InodeTable, ROOT_INODE, child_path};
use crate::ops::FuseHighLevelOps;

/// Reported as `f_namemax`.
const NAME_MAX: u32 = 255;

/// `d_ino` for listed names the kernel has not looked up. Zero would make
/// libc skip the entry.
const UNKNOWN_INO: u64 = 0xffff_ffff;

/// The mounted filesystem.
pub struct OxFs {
    ops: Arc<FuseHighLevelOps>,
    inodes: InodeTable,
    ttl: Duration,
}

impl OxFs {
    pub fn new(ops: Arc<FuseHighLevelOps>) -> Self {
        let ttl = ops.config().attr_ttl;
        Self {
            ops,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path(ino).ok_or_else(|| {
            if self.inodes.is_detached(ino) {
                trace!(inode = ino, "Inode has lost its name");
            }
            FuseError::InvalidInode(ino)
        })
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name
            .to_str()
            .ok_or_else(|| FuseError::InvalidPath(name.to_string_lossy().into_owned()))?;
        Ok(child_path(&self.path_of(parent)?, name))
    }

    /// The spelling used as the inode-table key.
    ///
    /// With case-insensitive matching, `/Foo` and `/foo` name the same object
    /// and must map to one inode, so the stored spelling is used.
    fn canonical(&self, path: &str) -> FuseResult<String> {
        if self.ops.has_getpath() {
            self.ops.getpath(path)
        } else {
            Ok(path.to_string())
        }
    }

    fn entry_reply(&self, path: &str, stat: &FileStat, reply: ReplyEntry) {
        let ino = self.inodes.get_or_insert(path);
        reply.entry(&self.ttl, &stat.to_file_attr(ino), 0);
    }

    /// Resolve `name` under `parent` and count the kernel's lookup.
    fn lookup_entry(&self, parent: u64, name: &OsStr) -> FuseResult<(u64, FileStat)> {
        let path = self.canonical(&self.child_of(parent, name)?)?;
        let stat = self.ops.getattr(&path)?;
        Ok((self.inodes.get_or_insert(&path), stat))
    }

    /// Apply a `setattr`. With a handle every step goes through it, so an
    /// open file keeps answering after its name is gone.
    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> FuseResult<FileStat> {
        let atime = atime.map(resolve_time);
        let mtime = mtime.map(resolve_time);
        let times = atime.is_some() || mtime.is_some();

        if let Some(fh) = fh {
            if let Some(mode) = mode {
                self.ops.fchmod(fh, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.ops.fchown(fh, uid, gid)?;
            }
            if let Some(size) = size {
                self.ops.ftruncate(fh, size)?;
            }
            if times {
                self.ops.futimens(fh, atime, mtime)?;
            }
            return self.ops.fgetattr(fh);
        }

        let path = self.path_of(ino)?;
        if let Some(mode) = mode {
            self.ops.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.ops.chown(&path, uid, gid)?;
        }
        if let Some(size) = size {
            self.ops.truncate(&path, size)?;
        }
        if times {
            self.ops.utimens(&path, atime, mtime)?;
        }
        self.ops.getattr(&path)
    }

    /// Unlink or rmdir `name`, detaching its inode.
    fn remove_entry(&self, parent: u64, name: &OsStr, is_dir: bool) -> FuseResult<()> {
        let path = self.canonical(&self.child_of(parent, name)?)?;
        if is_dir {
            self.ops.rmdir(&path)?;
        } else {
            self.ops.unlink(&path)?;
        }
        self.inodes.invalidate_path(&path);
        Ok(())
    }

    /// Rename and move the inode bindings along. A replaced target's inode is
    /// detached. Renaming one link of a file onto another changes nothing.
    fn rename_entry(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> FuseResult<()> {
        let from = self.canonical(&self.child_of(parent, name)?)?;
        let to = self.child_of(newparent, newname)?;
        let replaced = self.canonical(&to).ok();
        if !self.ops.rename(&from, &to)? {
            return Ok(());
        }

        // Case-insensitively the target may be stored under another spelling.
        if let Some(replaced) = replaced.filter(|r| *r != from && *r != to) {
            self.inodes.invalidate_path(&replaced);
        }
        self.inodes.rename(&from, &to);
        Ok(())
    }

    /// `.`, `..` and the children of an open directory. Children the kernel
    /// has looked up report their inode; others get [`UNKNOWN_INO`] so that
    /// listing never allocates inodes the kernel will not forget.
    fn dir_entries(&self, ino: u64, fh: u64) -> FuseResult<Vec<(u64, FileType, String)>> {
        let path = self.path_of(ino)?;
        let entries = self.ops.readdir(fh)?;

        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes.inode(parent_path(&path)).unwrap_or(UNKNOWN_INO)
        };
        let mut all = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let child = self
                .inodes
                .inode(&child_path(&path, &entry.name))
                .unwrap_or(UNKNOWN_INO);
            all.push((child, file_type(entry.kind), entry.name));
        }
        Ok(all)
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn xattr_mode(flags: i32) -> XattrMode {
    if flags & libc::XATTR_CREATE != 0 {
        XattrMode::Create
    } else if flags & libc::XATTR_REPLACE != 0 {
        XattrMode::Replace
    } else {
        XattrMode::Upsert
    }
}

/// Answer a size query or the data itself, per the xattr protocol.
fn reply_sized(bytes: &[u8], size: u32, reply: ReplyXattr) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    if size == 0 {
        reply.size(len);
    } else if len > size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(bytes);
    }
}

impl Filesystem for OxFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.ops.initialize().map_err(|e| {
            error!(error = %e, "Failed to open the root directory");
            e.to_errno()
        })
    }

    fn destroy(&mut self) {
        self.ops.shutdown();
        info!("Filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_entry(parent, name) {
            Ok((ino, stat)) => reply.entry(&self.ttl, &stat.to_file_attr(ino), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let result = match fh {
            Some(fh) => self.ops.fgetattr(fh),
            None => self.path_of(ino).and_then(|path| self.ops.getattr(&path)),
        };
        match result {
            Ok(stat) => reply.attr(&self.ttl, &stat.to_file_attr(ino)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(stat) => reply.attr(&self.ttl, &stat.to_file_attr(ino)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.path_of(ino).and_then(|path| self.ops.readlink(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.ops
                .mkdir(&path, mode & !umask, req.uid(), req.gid())
                .map(|stat| (path, stat))
        });
        match result {
            Ok((path, stat)) => self.entry_reply(&path, &stat, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, link_name).and_then(|path| {
            self.ops
                .symlink(target, &path, req.uid(), req.gid())
                .map(|stat| (path, stat))
        });
        match result {
            Ok((path, stat)) => self.entry_reply(&path, &stat, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            debug!(flags, "rename flags not supported");
            reply.error(libc::EINVAL);
            return;
        }
        match self.rename_entry(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.path_of(ino).and_then(|existing| {
            let path = self.child_of(newparent, newname)?;
            let stat = self.ops.link(&existing, &path)?;
            Ok((path, stat))
        });
        match result {
            Ok((path, stat)) => self.entry_reply(&path, &stat, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.path_of(ino).and_then(|path| self.ops.open(&path, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.ops.read(fh, offset, usize::try_from(size).unwrap_or(usize::MAX)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.ops.write(fh, offset, data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.ops.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.ops.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.ops.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path_of(ino).and_then(|path| self.ops.opendir(&path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let all = match self.dir_entries(ino, fh) {
            Ok(all) => all,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child, kind, name)) in all.into_iter().enumerate().skip(skip) {
            let next = i64::try_from(i + 1).unwrap_or(i64::MAX);
            if reply.add(child, next, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.ops.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.ops.statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                stats.files_free,
                stats.block_size,
                stats.name_max.min(NAME_MAX),
                stats.block_size,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.ops
                .create(&path, mode & !umask, flags, req.uid(), req.gid())
                .map(|created| (path, created))
        });
        match result {
            Ok((path, (fh, stat))) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.created(&self.ttl, &stat.to_file_attr(ino), 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            let name = name.to_str().ok_or(FuseError::NotSupported)?;
            self.ops.getxattr(&path, name)
        });
        match result {
            Ok(value) => reply_sized(&value, size, reply),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            let name = name.to_str().ok_or(FuseError::NotSupported)?;
            self.ops.setxattr(&path, name, value, xattr_mode(flags))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.path_of(ino).and_then(|path| self.ops.listxattr(&path)) {
            Ok(names) => {
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                reply_sized(&packed, size, reply);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.path_of(ino).and_then(|path| {
            let name = name.to_str().ok_or(FuseError::NotSupported)?;
            self.ops.removexattr(&path, name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.path_of(ino).and_then(|path| self.ops.getattr(&path)) {
            Ok(_) if mask & libc::W_OK != 0 && self.ops.config().read_only => {
                reply.error(libc::EROFS);
            }
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use oxfs_core::{FileTable, MasterKey, OsStorage, init_repository};
    use tempfile::TempDir;

    use super::*;
    use crate::config::MountConfig;

    fn mount(config: MountConfig) -> (TempDir, OxFs) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let dir = TempDir::new().expect("temp dir");
        let storage = OsStorage::new(dir.path().join("repo"));
        let key = MasterKey::generate();
        init_repository(&storage, &key).expect("init");
        let ops = Arc::new(FuseHighLevelOps::new(
            Arc::new(FileTable::new(storage, key)),
            config,
        ));
        ops.initialize().expect("initialize");
        (dir, OxFs::new(ops))
    }

    /// Create `path` and leave it open read-write.
    fn create_open(fs: &OxFs, path: &str, data: &[u8]) -> u64 {
        let (fh, _) = fs
            .ops
            .create(path, 0o644, libc::O_CREAT | libc::O_RDWR, 1000, 1000)
            .expect("create");
        fs.ops.write(fh, 0, data).expect("write");
        fh
    }

    fn lookup(fs: &OxFs, name: &str) -> u64 {
        fs.lookup_entry(ROOT_INODE, OsStr::new(name)).expect("lookup").0
    }

    #[test]
    fn test_setattr_through_handle_after_unlink() {
        let (_dir, fs) = mount(MountConfig::default());
        let fh = create_open(&fs, "/f", b"hello world");
        let ino = lookup(&fs, "f");
        fs.remove_entry(ROOT_INODE, OsStr::new("f"), false).expect("unlink");

        let stat = fs
            .apply_setattr(
                ino,
                Some(0o600),
                None,
                None,
                Some(3),
                Some(TimeOrNow::Now),
                None,
                Some(fh),
            )
            .expect("setattr through handle");
        assert_eq!(stat.size, 3);
        assert_eq!(stat.perm, 0o600);
        assert_eq!(fs.ops.fgetattr(fh).expect("fgetattr").size, 3);
        assert_eq!(fs.ops.read(fh, 0, 64).expect("read"), b"hel");

        // Without the handle there is no name left to act on.
        let err = fs
            .apply_setattr(ino, Some(0o644), None, None, None, None, None, None)
            .expect_err("unlinked inode has no path");
        assert_eq!(err.to_errno(), libc::ENOENT);

        fs.ops.release(fh).expect("release");
    }

    #[test]
    fn test_old_inode_does_not_reach_recreated_name() {
        let (_dir, fs) = mount(MountConfig::default());
        let old_fh = create_open(&fs, "/f", b"old");
        let old = lookup(&fs, "f");
        fs.remove_entry(ROOT_INODE, OsStr::new("f"), false).expect("unlink");

        let new_fh = create_open(&fs, "/f", b"new");
        fs.ops.release(new_fh).expect("release");
        let new = lookup(&fs, "f");
        assert_ne!(old, new);

        let err = fs
            .apply_setattr(old, Some(0o600), None, None, None, None, None, None)
            .expect_err("old inode must not resolve");
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert_eq!(fs.ops.getattr("/f").expect("getattr").perm, 0o644);

        // The old object is still reachable through its handle.
        let stat = fs
            .apply_setattr(old, Some(0o600), None, None, None, None, None, Some(old_fh))
            .expect("setattr through handle");
        assert_eq!(stat.perm, 0o600);
        assert_eq!(fs.ops.getattr("/f").expect("getattr").perm, 0o644);

        fs.ops.release(old_fh).expect("release");
        fs.inodes.forget(old, 1);
        assert_eq!(fs.inodes.inode("/f"), Some(new));
    }

    #[test]
    fn test_rename_over_existing_target() {
        let (_dir, fs) = mount(MountConfig::default());
        for (path, data) in [("/a", b"aaa"), ("/b", b"bbb")] {
            let fh = create_open(&fs, path, data);
            fs.ops.release(fh).expect("release");
        }
        let a = lookup(&fs, "a");
        let b = lookup(&fs, "b");

        fs.rename_entry(ROOT_INODE, OsStr::new("a"), ROOT_INODE, OsStr::new("b"))
            .expect("rename");
        assert_eq!(fs.path_of(a).expect("moved inode").as_str(), "/b");
        assert_eq!(
            fs.path_of(b).expect_err("replaced inode").to_errno(),
            libc::ENOENT
        );
        assert_eq!(lookup(&fs, "b"), a);
        assert_eq!(
            fs.lookup_entry(ROOT_INODE, OsStr::new("a"))
                .expect_err("source is gone")
                .to_errno(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_rename_between_links_keeps_both_inodes() {
        let (_dir, fs) = mount(MountConfig::default());
        let fh = create_open(&fs, "/a", b"x");
        fs.ops.release(fh).expect("release");
        fs.ops.link("/a", "/b").expect("link");
        let a = lookup(&fs, "a");
        let b = lookup(&fs, "b");

        fs.rename_entry(ROOT_INODE, OsStr::new("a"), ROOT_INODE, OsStr::new("b"))
            .expect("rename");
        assert_eq!(fs.path_of(a).expect("a").as_str(), "/a");
        assert_eq!(fs.path_of(b).expect("b").as_str(), "/b");
    }

    #[test]
    fn test_rename_directory_moves_child_inodes() {
        let (_dir, fs) = mount(MountConfig::default());
        fs.ops.mkdir("/d", 0o755, 1000, 1000).expect("mkdir");
        let fh = create_open(&fs, "/d/f", b"x");
        fs.ops.release(fh).expect("release");
        let d = lookup(&fs, "d");
        let f = fs.lookup_entry(d, OsStr::new("f")).expect("lookup").0;

        fs.rename_entry(ROOT_INODE, OsStr::new("d"), ROOT_INODE, OsStr::new("e"))
            .expect("rename");
        assert_eq!(fs.path_of(f).expect("child").as_str(), "/e/f");
        let stat = fs
            .apply_setattr(f, None, None, None, Some(0), None, None, None)
            .expect("truncate by path");
        assert_eq!(stat.size, 0);
    }

    #[test]
    fn test_rmdir_detaches_inode() {
        let (_dir, fs) = mount(MountConfig::default());
        fs.ops.mkdir("/d", 0o755, 1000, 1000).expect("mkdir");
        let d = lookup(&fs, "d");
        fs.remove_entry(ROOT_INODE, OsStr::new("d"), true).expect("rmdir");
        assert!(fs.inodes.is_detached(d));
        fs.ops.mkdir("/d", 0o755, 1000, 1000).expect("mkdir again");
        assert_ne!(lookup(&fs, "d"), d);
    }

    #[test]
    fn test_case_insensitive_names_share_one_inode() {
        let (_dir, fs) = mount(MountConfig::default().case_insensitive(true));
        let fh = create_open(&fs, "/Foo", b"x");
        fs.ops.release(fh).expect("release");

        let ino = lookup(&fs, "foo");
        assert_eq!(lookup(&fs, "FOO"), ino);
        assert_eq!(lookup(&fs, "Foo"), ino);
        assert_eq!(fs.path_of(ino).expect("path").as_str(), "/Foo");

        fs.remove_entry(ROOT_INODE, OsStr::new("fOO"), false).expect("unlink");
        assert!(fs.inodes.is_detached(ino));
    }

    #[test]
    fn test_case_insensitive_rename_detaches_differently_cased_target() {
        let (_dir, fs) = mount(MountConfig::default().case_insensitive(true));
        for path in ["/a", "/b"] {
            let fh = create_open(&fs, path, b"x");
            fs.ops.release(fh).expect("release");
        }
        let a = lookup(&fs, "a");
        let b = lookup(&fs, "b");

        fs.rename_entry(ROOT_INODE, OsStr::new("a"), ROOT_INODE, OsStr::new("B"))
            .expect("rename");
        assert!(fs.inodes.is_detached(b));
        assert_eq!(lookup(&fs, "b"), a);
    }

    #[test]
    fn test_readdir_does_not_allocate_inodes() {
        let (_dir, fs) = mount(MountConfig::default());
        for path in ["/a", "/b"] {
            let fh = create_open(&fs, path, b"x");
            fs.ops.release(fh).expect("release");
        }
        let a = lookup(&fs, "a");
        let before = fs.inodes.len();

        let fh = fs.ops.opendir("/").expect("opendir");
        let listed = fs.dir_entries(ROOT_INODE, fh).expect("readdir");
        fs.ops.releasedir(fh).expect("releasedir");

        let ino_of = |name: &str| {
            listed
                .iter()
                .find(|(_, _, n)| n == name)
                .map(|(ino, _, _)| *ino)
        };
        assert_eq!(ino_of("."), Some(ROOT_INODE));
        assert_eq!(ino_of(".."), Some(ROOT_INODE));
        assert_eq!(ino_of("a"), Some(a));
        assert_eq!(ino_of("b"), Some(UNKNOWN_INO));
        assert_eq!(fs.inodes.len(), before);
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/a/b"), "/a");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn test_xattr_mode_from_flags() {
        assert_eq!(xattr_mode(0), XattrMode::Upsert);
        assert_eq!(xattr_mode(libc::XATTR_CREATE), XattrMode::Create);
        assert_eq!(xattr_mode(libc::XATTR_REPLACE), XattrMode::Replace);
    }
}
