//! Path-based filesystem operations over the file table.
//!
//! Every operation resolves its path from the root by decrypting one
//! directory at a time, takes file-table references for the nodes it
//! touches, and returns them before it finishes. Open handles keep their
//! reference in the [`HandleTable`] until `release`.
//!
//! # Locking
//!
//! - A node's access lock guards its content, metadata and entries.
//! - Outside of `rename`, an operation holds at most a parent lock plus the
//!   lock of one of its children, always in that order.
//! - Namespace-changing operations share `namespace`; `rename` takes it
//!   exclusively because it locks two parents that are not ancestor-ordered.
//! - Reads, writes and attribute changes through handles never touch
//!   `namespace`, so a write proceeds while its file is renamed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use oxfs_core::{
    DirEntry, FileId, FileKind, FileNode, FileTable, FsError, NodeRef, RESERVED_ROOT_NAMES,
    StorageStats, XattrMode, fold_name,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::attr::{FileStat, postprocess_stat};
use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::handles::{HandleTable, OpenFile};

/// One `readdir` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub name: String,
    pub kind: FileKind,
    pub id: FileId,
}

/// Path-based operations of a mounted repository.
#[derive(Debug)]
pub struct FuseHighLevelOps {
    table: Arc<FileTable>,
    handles: HandleTable,
    config: MountConfig,
    namespace: RwLock<()>,
    /// Reference to the root directory held for the mount's lifetime.
    root: Mutex<Option<Arc<FileNode>>>,
}

impl FuseHighLevelOps {
    pub fn new(table: Arc<FileTable>, config: MountConfig) -> Self {
        Self {
            table,
            handles: HandleTable::new(),
            config,
            namespace: RwLock::new(()),
            root: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<FileTable> {
        &self.table
    }

    /// Number of open file and directory handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    // ==================== Lifecycle ====================

    /// Open the root directory and keep it live until [`shutdown`](Self::shutdown).
    pub fn initialize(&self) -> FuseResult<()> {
        let mut root = self.root.lock();
        if root.is_none() {
            let node = self.table.open_as(FileId::root(), Some(FileKind::Directory))?;
            *root = Some(node);
        }
        info!(
            read_only = self.config.read_only,
            case_insensitive = self.config.case_insensitive,
            "Filesystem initialized"
        );
        Ok(())
    }

    /// Close every open handle and the root, then evict what is left.
    pub fn shutdown(&self) {
        let open = self.handles.drain();
        if !open.is_empty() {
            info!(count = open.len(), "Closing handles still open at unmount");
        }
        for handle in open {
            if let Err(e) = self.table.close(&handle.node) {
                warn!(id = %handle.node.id(), error = %e, "Close failed at unmount");
            }
        }
        if let Some(root) = self.root.lock().take()
            && let Err(e) = self.table.close(&root)
        {
            warn!(error = %e, "Closing root failed at unmount");
        }
        self.table.evict_all();
    }

    pub fn statfs(&self) -> FuseResult<StorageStats> {
        Ok(self.table.storage().statvfs()?)
    }

    // ==================== Resolution ====================

    /// Resolve `path` to its node.
    pub fn open_all(&self, path: &str) -> FuseResult<NodeRef<'_>> {
        let parts = components(path)?;
        self.resolve(path, &parts)
    }

    /// Resolve the parent of `path`, returning it with the final component.
    pub fn open_base<'p>(&self, path: &'p str) -> FuseResult<(NodeRef<'_>, &'p str)> {
        let mut parts = components(path)?;
        let name = parts
            .pop()
            .ok_or_else(|| FsError::InvalidArgument(format!("{path} has no parent")))?;
        let parent = self.resolve(path, &parts)?;
        if parent.kind() != FileKind::Directory {
            return Err(FsError::NotADirectory(path.to_string()).into());
        }
        Ok((parent, name))
    }

    fn resolve(&self, path: &str, parts: &[&str]) -> FuseResult<NodeRef<'_>> {
        let mut current = self.table.open_ref(FileId::root(), Some(FileKind::Directory))?;
        for name in parts {
            if current.kind() != FileKind::Directory {
                return Err(FsError::NotADirectory(path.to_string()).into());
            }
            let (_, entry) = self.lookup_child(&current, name)?;
            current = self.table.open_ref(entry.id, Some(entry.kind))?;
        }
        Ok(current)
    }

    /// Find `name` in `dir`, returning the stored name and entry.
    fn lookup_child(&self, dir: &FileNode, name: &str) -> FuseResult<(String, DirEntry)> {
        if dir.id().is_root() && is_reserved(name) {
            return Err(FsError::NotFound(name.to_string()).into());
        }
        dir.lock()
            .find_entry(name, self.config.case_insensitive)?
            .ok_or_else(|| FsError::NotFound(name.to_string()).into())
    }

    /// Create a node of `kind` at `path` and link it into its parent.
    ///
    /// The parent entry is added only after the child's storage is fully
    /// initialized, under the parent's lock, so a failure leaves no
    /// dangling entry and a racing create of the same name gets `EEXIST`.
    pub fn create_node(
        &self,
        path: &str,
        kind: FileKind,
        mode: u32,
        owner: (u32, u32),
        link_target: Option<&[u8]>,
    ) -> FuseResult<NodeRef<'_>> {
        self.ensure_writable()?;
        let _ns = self.namespace.read();
        let (parent, name) = self.open_base(path)?;
        if parent.id().is_root() && is_reserved(name) {
            return Err(FsError::NotPermitted(format!("{name} is reserved")).into());
        }

        let mut dir = parent.lock();
        if dir.find_entry(name, self.config.case_insensitive)?.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()).into());
        }
        if name.len() > oxfs_core::codec::MAX_NAME_LEN {
            return Err(FsError::NameTooLong(name.to_string()).into());
        }

        let id = FileId::random();
        let (uid, gid) = owner;
        let child = NodeRef::new(
            &self.table,
            self.table.create_as(id, kind, mode & 0o7777, uid, gid)?,
        );
        let linked = link_target
            .map_or(Ok(()), |target| child.lock().write_link_target(target))
            .and_then(|()| {
                dir.add_entry(name, DirEntry { id, kind }, self.config.case_insensitive)
            });
        if let Err(e) = linked {
            child.lock().mark_unlinked();
            return Err(e.into());
        }
        if kind == FileKind::Directory {
            dir.inc_nlink();
        }
        debug!(path, id = %id, ?kind, "Created");
        drop(dir);
        Ok(child)
    }

    // ==================== Attributes ====================

    pub fn getattr(&self, path: &str) -> FuseResult<FileStat> {
        let node = self.open_all(path)?;
        Ok(self.stat_of(&node))
    }

    pub fn fgetattr(&self, fh: u64) -> FuseResult<FileStat> {
        let handle = self.handle(fh)?;
        Ok(self.stat_of(&handle.node))
    }

    fn stat_of(&self, node: &FileNode) -> FileStat {
        let mut stat = FileStat::from(&node.lock().stat());
        postprocess_stat(&mut stat, &self.config.owner_override);
        stat
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let node = self.open_all(path)?;
        node.lock().chmod(mode);
        Ok(self.stat_of(&node))
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let node = self.open_all(path)?;
        node.lock().chown(uid, gid);
        Ok(self.stat_of(&node))
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let node = self.open_all(path)?;
        node.lock().utimens(atime, mtime);
        Ok(self.stat_of(&node))
    }

    // The handle variants reach unlinked files too.

    pub fn fchmod(&self, fh: u64, mode: u32) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let handle = self.handle(fh)?;
        handle.node.lock().chmod(mode);
        Ok(self.stat_of(&handle.node))
    }

    pub fn fchown(&self, fh: u64, uid: Option<u32>, gid: Option<u32>) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let handle = self.handle(fh)?;
        handle.node.lock().chown(uid, gid);
        Ok(self.stat_of(&handle.node))
    }

    pub fn futimens(
        &self,
        fh: u64,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let handle = self.handle(fh)?;
        handle.node.lock().utimens(atime, mtime);
        Ok(self.stat_of(&handle.node))
    }

    // ==================== Directories ====================

    pub fn opendir(&self, path: &str) -> FuseResult<u64> {
        let node = self.open_all(path)?;
        if node.kind() != FileKind::Directory {
            return Err(FsError::NotADirectory(path.to_string()).into());
        }
        Ok(self
            .handles
            .insert_auto(OpenFile::new(node.into_inner(), libc::O_RDONLY)))
    }

    /// Plaintext entries of an open directory, reserved names excluded.
    pub fn readdir(&self, fh: u64) -> FuseResult<Vec<DirListing>> {
        let handle = self.handle(fh)?;
        let is_root = handle.node.id().is_root();
        let state = handle.node.lock();
        Ok(state
            .entries()?
            .iter()
            .filter(|(name, _)| !(is_root && is_reserved(name)))
            .map(|(name, entry)| DirListing {
                name: name.clone(),
                kind: entry.kind,
                id: entry.id,
            })
            .collect())
    }

    pub fn releasedir(&self, fh: u64) -> FuseResult<()> {
        self.release(fh)
    }

    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> FuseResult<FileStat> {
        let node = self.create_node(path, FileKind::Directory, mode, (uid, gid), None)?;
        Ok(self.stat_of(&node))
    }

    pub fn rmdir(&self, path: &str) -> FuseResult<()> {
        self.ensure_writable()?;
        let _ns = self.namespace.read();
        let (parent, name) = self.open_base(path)?;
        if parent.id().is_root() && is_reserved(name) {
            return Err(FsError::NotFound(name.to_string()).into());
        }

        let mut dir = parent.lock();
        let (stored, entry) = dir
            .find_entry(name, self.config.case_insensitive)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if entry.kind != FileKind::Directory {
            return Err(FsError::NotADirectory(path.to_string()).into());
        }
        let child = self.table.open_ref(entry.id, Some(FileKind::Directory))?;
        {
            let mut state = child.lock();
            if !state.is_empty_dir()? {
                return Err(FsError::NotEmpty(path.to_string()).into());
            }
            state.mark_unlinked();
        }
        dir.remove_entry(&stored)?;
        dir.dec_nlink();
        drop(dir);
        debug!(path, id = %entry.id, "Removed directory");
        Ok(child.release()?)
    }

    // ==================== Files ====================

    /// Create and open a regular file.
    pub fn create(
        &self,
        path: &str,
        mode: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> FuseResult<(u64, FileStat)> {
        let node = self.create_node(path, FileKind::RegularFile, mode, (uid, gid), None)?;
        let stat = self.stat_of(&node);
        let fh = self.handles.insert_auto(OpenFile::new(node.into_inner(), flags));
        Ok((fh, stat))
    }

    pub fn open(&self, path: &str, flags: i32) -> FuseResult<u64> {
        let wants_write = matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR);
        if wants_write || flags & libc::O_TRUNC != 0 {
            self.ensure_writable()?;
        }
        let node = self.open_all(path)?;
        match node.kind() {
            FileKind::Directory if wants_write => {
                return Err(FsError::IsADirectory(path.to_string()).into());
            }
            FileKind::RegularFile if wants_write && flags & libc::O_TRUNC != 0 => {
                node.lock().truncate(0)?;
            }
            _ => {}
        }
        let fh = self.handles.insert_auto(OpenFile::new(node.into_inner(), flags));
        debug!(path, fh, "Opened");
        Ok(fh)
    }

    /// Drop the handle's reference; the last one evicts the node.
    pub fn release(&self, fh: u64) -> FuseResult<()> {
        let handle = self.handles.remove(fh).ok_or(FuseError::InvalidHandle(fh))?;
        Ok(self.table.close(&handle.node)?)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> FuseResult<Vec<u8>> {
        let handle = self.handle(fh)?;
        let mut buf = vec![0u8; size];
        let n = handle.node.lock().read(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FuseResult<usize> {
        self.ensure_writable()?;
        let handle = self.handle(fh)?;
        if !handle.writable() {
            return Err(FuseError::InvalidHandle(fh));
        }
        let mut state = handle.node.lock();
        let offset = if handle.flags & libc::O_APPEND != 0 {
            state.stat().size
        } else {
            offset
        };
        Ok(state.write(offset, data)?)
    }

    pub fn flush(&self, fh: u64) -> FuseResult<()> {
        let handle = self.handle(fh)?;
        Ok(handle.node.lock().flush()?)
    }

    pub fn fsync(&self, fh: u64, data_only: bool) -> FuseResult<()> {
        let handle = self.handle(fh)?;
        Ok(handle.node.lock().fsync(data_only)?)
    }

    pub fn truncate(&self, path: &str, size: u64) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let node = self.open_all(path)?;
        node.lock().truncate(size)?;
        Ok(self.stat_of(&node))
    }

    pub fn ftruncate(&self, fh: u64, size: u64) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let handle = self.handle(fh)?;
        handle.node.lock().truncate(size)?;
        Ok(self.stat_of(&handle.node))
    }

    /// Remove a name. Storage goes away once no name and no handle refers to it.
    pub fn unlink(&self, path: &str) -> FuseResult<()> {
        self.ensure_writable()?;
        let _ns = self.namespace.read();
        let (parent, name) = self.open_base(path)?;
        if parent.id().is_root() && is_reserved(name) {
            return Err(FsError::NotFound(name.to_string()).into());
        }
        let entry = {
            let mut dir = parent.lock();
            let (stored, entry) = dir
                .find_entry(name, self.config.case_insensitive)?
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if entry.kind == FileKind::Directory {
                return Err(FsError::IsADirectory(path.to_string()).into());
            }
            dir.remove_entry(&stored)?;
            entry
        };
        debug!(path, id = %entry.id, "Unlinked");
        self.drop_link(entry)
    }

    /// Account for one fewer name referring to `entry`.
    fn drop_link(&self, entry: DirEntry) -> FuseResult<()> {
        let node = match self.table.open_ref(entry.id, Some(entry.kind)) {
            Ok(node) => node,
            Err(FsError::NotFound(_)) => {
                warn!(id = %entry.id, "Removed entry pointed at missing storage");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        {
            let mut state = node.lock();
            if entry.kind == FileKind::Directory || state.dec_nlink() == 0 {
                state.mark_unlinked();
            }
        }
        Ok(node.release()?)
    }

    // ==================== Links ====================

    pub fn symlink(&self, target: &Path, path: &str, uid: u32, gid: u32) -> FuseResult<FileStat> {
        use std::os::unix::ffi::OsStrExt;

        let node = self.create_node(
            path,
            FileKind::Symlink,
            0o777,
            (uid, gid),
            Some(target.as_os_str().as_bytes()),
        )?;
        Ok(self.stat_of(&node))
    }

    pub fn readlink(&self, path: &str) -> FuseResult<PathBuf> {
        let node = self.open_all(path)?;
        Ok(node.lock().read_link()?)
    }

    /// Add a second name for an existing non-directory.
    pub fn link(&self, existing: &str, path: &str) -> FuseResult<FileStat> {
        self.ensure_writable()?;
        let _ns = self.namespace.read();
        let target = self.open_all(existing)?;
        if target.kind() == FileKind::Directory {
            return Err(FsError::NotPermitted(format!("cannot hard link directory {existing}")).into());
        }
        let (parent, name) = self.open_base(path)?;
        if parent.id().is_root() && is_reserved(name) {
            return Err(FsError::NotPermitted(format!("{name} is reserved")).into());
        }

        {
            let mut state = target.lock();
            if state.is_unlinked() {
                return Err(FsError::NotFound(existing.to_string()).into());
            }
            state.inc_nlink();
        }
        let entry = DirEntry {
            id: target.id(),
            kind: target.kind(),
        };
        let added = parent
            .lock()
            .add_entry(name, entry, self.config.case_insensitive);
        if let Err(e) = added {
            target.lock().dec_nlink();
            return Err(e.into());
        }
        debug!(existing, path, "Linked");
        Ok(self.stat_of(&target))
    }

    /// Move `from` to `to`, replacing a compatible destination.
    ///
    /// Returns `false` when both names already refer to the same object and
    /// nothing changed.
    pub fn rename(&self, from: &str, to: &str) -> FuseResult<bool> {
        self.ensure_writable()?;
        let _ns = self.namespace.write();
        let ci = self.config.case_insensitive;

        let (src_parent, src_name) = self.open_base(from)?;
        let (dst_parent, dst_name) = self.open_base(to)?;
        for (parent, name) in [(&src_parent, src_name), (&dst_parent, dst_name)] {
            if parent.id().is_root() && is_reserved(name) {
                return Err(FsError::NotPermitted(format!("{name} is reserved")).into());
            }
        }

        let same_parent = src_parent.id() == dst_parent.id();
        let (mut src, mut dst) = if same_parent {
            (src_parent.lock(), None)
        } else if src_parent.id() < dst_parent.id() {
            let src = src_parent.lock();
            (src, Some(dst_parent.lock()))
        } else {
            let dst = dst_parent.lock();
            (src_parent.lock(), Some(dst))
        };

        let (src_stored, moving) = src
            .find_entry(src_name, ci)?
            .ok_or_else(|| FsError::NotFound(from.to_string()))?;
        let existing = match dst.as_ref() {
            Some(dst) => dst.find_entry(dst_name, ci)?,
            None => src.find_entry(dst_name, ci)?,
        };

        if moving.kind == FileKind::Directory && is_descendant(from, to, ci)? {
            return Err(FsError::InvalidArgument(format!("cannot move {from} into itself")).into());
        }

        let mut replaced = None;
        if let Some((dst_stored, target)) = existing {
            if target.id == moving.id {
                // Same object: a case-only rename, or two links to one file.
                if same_parent && dst_stored == src_stored && dst_name != src_stored {
                    src.swap_entries(&[src_stored.as_str()], Some((dst_name, moving)))?;
                    return Ok(true);
                }
                return Ok(false);
            }
            match (moving.kind, target.kind) {
                (FileKind::Directory, FileKind::Directory) => {
                    let node = self.table.open_ref(target.id, Some(FileKind::Directory))?;
                    if !node.lock().is_empty_dir()? {
                        return Err(FsError::NotEmpty(to.to_string()).into());
                    }
                }
                (FileKind::Directory, _) => {
                    return Err(FsError::NotADirectory(to.to_string()).into());
                }
                (_, FileKind::Directory) => {
                    return Err(FsError::IsADirectory(to.to_string()).into());
                }
                _ => {}
            }
            replaced = Some((dst_stored, target));
        }

        let replaced_name = replaced.as_ref().map(|(name, _)| name.as_str());
        match dst.as_mut() {
            None => {
                let mut remove = vec![src_stored.as_str()];
                remove.extend(replaced_name);
                src.swap_entries(&remove, Some((dst_name, moving)))?;
            }
            Some(dst) => {
                let remove: Vec<&str> = replaced_name.into_iter().collect();
                dst.swap_entries(&remove, Some((dst_name, moving)))?;
                src.swap_entries(&[src_stored.as_str()], None)?;
                if moving.kind == FileKind::Directory {
                    src.dec_nlink();
                    dst.inc_nlink();
                }
            }
        }
        if let Some((_, target)) = &replaced
            && target.kind == FileKind::Directory
        {
            match dst.as_mut() {
                Some(dst) => dst.dec_nlink(),
                None => src.dec_nlink(),
            };
        }
        drop(dst);
        drop(src);
        debug!(from, to, id = %moving.id, "Renamed");

        if let Some((_, target)) = replaced {
            self.drop_link(target)?;
        }
        Ok(true)
    }

    // ==================== Extended attributes ====================

    pub fn listxattr(&self, path: &str) -> FuseResult<Vec<String>> {
        let node = self.open_all(path)?;
        Ok(node.lock().list_xattrs())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> FuseResult<Vec<u8>> {
        let node = self.open_all(path)?;
        Ok(node.lock().get_xattr(name)?)
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], mode: XattrMode) -> FuseResult<()> {
        self.ensure_writable()?;
        let node = self.open_all(path)?;
        Ok(node.lock().set_xattr(name, value, mode)?)
    }

    pub fn removexattr(&self, path: &str, name: &str) -> FuseResult<()> {
        self.ensure_writable()?;
        let node = self.open_all(path)?;
        Ok(node.lock().remove_xattr(name)?)
    }

    // ==================== Path lookup hook ====================

    /// `getpath` is only useful when names can differ in case from disk.
    pub fn has_getpath(&self) -> bool {
        self.config.case_insensitive
    }

    /// The on-disk spelling of `path`.
    pub fn getpath(&self, path: &str) -> FuseResult<String> {
        let parts = components(path)?;
        let mut current = self.table.open_ref(FileId::root(), Some(FileKind::Directory))?;
        let mut out = String::new();
        for name in parts {
            if current.kind() != FileKind::Directory {
                return Err(FsError::NotADirectory(path.to_string()).into());
            }
            let (stored, entry) = self.lookup_child(&current, name)?;
            out.push('/');
            out.push_str(&stored);
            current = self.table.open_ref(entry.id, Some(entry.kind))?;
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(out)
    }

    // ==================== Helpers ====================

    fn handle(&self, fh: u64) -> FuseResult<OpenFile> {
        self.handles.get(fh).ok_or(FuseError::InvalidHandle(fh))
    }

    fn ensure_writable(&self) -> FuseResult<()> {
        if self.config.read_only {
            return Err(FsError::ReadOnly.into());
        }
        Ok(())
    }
}

fn is_reserved(name: &str) -> bool {
    RESERVED_ROOT_NAMES.contains(&name)
}

/// Split an absolute path into components, rejecting `.` and `..`.
fn components(path: &str) -> FuseResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FuseError::InvalidPath(path.to_string()));
    }
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if parts.iter().any(|c| *c == "." || *c == "..") {
        return Err(FuseError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Whether `to` lies strictly beneath `from`.
fn is_descendant(from: &str, to: &str, case_insensitive: bool) -> FuseResult<bool> {
    let from = components(from)?;
    let to = components(to)?;
    if to.len() <= from.len() {
        return Ok(false);
    }
    Ok(from.iter().zip(&to).all(|(a, b)| {
        if case_insensitive {
            fold_name(a) == fold_name(b)
        } else {
            a == b
        }
    }))
}
