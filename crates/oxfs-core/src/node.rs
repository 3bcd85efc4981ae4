//! In-memory representation of one open encrypted object.
//!
//! A [`FileNode`] is created and destroyed only by the
//! [`FileTable`](crate::table::FileTable). Everything mutable lives in
//! [`NodeState`] behind the node's access lock; callers take it with
//! [`FileNode::lock`] for the duration of one operation.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use crate::codec::{
    CodecError, ContentStream, DirEntry, FileKind, MAX_NAME_LEN, Metadata, decode_entries,
    encode_entries, open_metadata, raw_len_for_size, seal_metadata,
};
use crate::error::{FsError, FsResult};
use crate::id::FileId;
use crate::key::{KEY_LEN, MasterKey};
use crate::storage::OsStorage;

/// Attribute snapshot of a node, before any presentation overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStat {
    pub id: FileId,
    pub kind: FileKind,
    pub size: u64,
    /// 512-byte blocks used by the raw content stream.
    pub blocks: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// How `set_xattr` treats an existing attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XattrMode {
    #[default]
    Upsert,
    /// Fail with `AlreadyExists` if present.
    Create,
    /// Fail with `NoAttribute` if absent.
    Replace,
}

/// Fold a name for case-insensitive comparison: NFC, then lowercase.
pub fn fold_name(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

/// One live encrypted object. At most one exists per [`FileId`].
#[derive(Debug)]
pub struct FileNode {
    id: FileId,
    kind: FileKind,
    /// Mutated only inside the file table's per-identifier critical section.
    pub(crate) refcount: AtomicU64,
    state: Mutex<NodeState>,
}

impl FileNode {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Number of references currently held through the file table.
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take the node's access lock.
    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    pub(crate) fn open(
        storage: &OsStorage,
        key: &MasterKey,
        id: FileId,
        kind_hint: Option<FileKind>,
        read_only: bool,
    ) -> FsResult<Self> {
        let flags = if read_only { libc::O_RDONLY } else { libc::O_RDWR };
        let file = storage
            .open_stream(id.raw_name(), flags, 0)
            .map_err(|e| missing_as_not_found(e, id))?;
        let content_key = key.derive_content_key(&id);
        let content =
            ContentStream::open(file, id, &content_key).map_err(|e| FsError::from_codec(id, e))?;
        let kind = content.kind();
        if let Some(hint) = kind_hint
            && hint != kind
        {
            return Err(FsError::from_codec(
                id,
                CodecError::InvalidHeader {
                    id,
                    reason: format!("directory entry says {hint:?}, header says {kind:?}"),
                },
            ));
        }

        let raw_meta = storage
            .read(id.raw_meta_name())
            .map_err(|e| missing_as_not_found(e, id))?;
        let meta =
            open_metadata(&raw_meta, id, &content_key).map_err(|e| FsError::from_codec(id, e))?;

        let entries = if kind == FileKind::Directory {
            let plain = content.read_all().map_err(|e| FsError::from_codec(id, e))?;
            Some(decode_entries(id, &plain).map_err(|e| FsError::from_codec(id, e))?)
        } else {
            None
        };

        debug!(id = %id, ?kind, size = content.size(), "Opened node");
        Ok(Self::assemble(
            storage,
            content_key,
            content,
            meta,
            entries,
            read_only,
        ))
    }

    pub(crate) fn create(
        storage: &OsStorage,
        key: &MasterKey,
        id: FileId,
        kind: FileKind,
        meta: Metadata,
    ) -> FsResult<Self> {
        let raw_name = id.raw_name();
        if let Some(parent) = raw_name.parent() {
            storage.create_dir_all(parent)?;
        }
        let file = storage
            .open_stream(&raw_name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o600)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => FsError::AlreadyExists(id.to_string()),
                _ => FsError::StorageIo(e),
            })?;

        let content_key = key.derive_content_key(&id);
        let built = ContentStream::create(file, id, kind, &content_key)
            .map_err(|e| FsError::from_codec(id, e))
            .and_then(|content| {
                let entries = (kind == FileKind::Directory).then(BTreeMap::new);
                let mut node = Self::assemble(storage, content_key, content, meta, entries, false);
                node.state.get_mut().dirty = true;
                node.state.get_mut().flush()?;
                Ok(node)
            });
        if built.is_err() {
            storage.remove_file_nothrow(&raw_name);
            storage.remove_file_nothrow(id.raw_meta_name());
        } else {
            debug!(id = %id, ?kind, "Created node");
        }
        built
    }

    fn assemble(
        storage: &OsStorage,
        content_key: Zeroizing<[u8; KEY_LEN]>,
        content: ContentStream,
        meta: Metadata,
        entries: Option<BTreeMap<String, DirEntry>>,
        read_only: bool,
    ) -> Self {
        let id = content.id();
        let kind = content.kind();
        Self {
            id,
            kind,
            refcount: AtomicU64::new(0),
            state: Mutex::new(NodeState {
                id,
                storage: storage.clone(),
                content_key,
                content,
                meta,
                dirty: false,
                entries,
                unlinked: false,
                read_only,
            }),
        }
    }
}

fn missing_as_not_found(e: io::Error, id: FileId) -> FsError {
    if e.kind() == io::ErrorKind::NotFound {
        warn!(id = %id, "Object storage missing");
        FsError::NotFound(id.to_string())
    } else {
        FsError::StorageIo(e)
    }
}

/// Mutable state of a node, reachable only through its access lock.
pub struct NodeState {
    id: FileId,
    storage: OsStorage,
    content_key: Zeroizing<[u8; KEY_LEN]>,
    content: ContentStream,
    meta: Metadata,
    /// In-memory metadata differs from the persisted record.
    dirty: bool,
    /// Decoded entries; `Some` only for directories.
    entries: Option<BTreeMap<String, DirEntry>>,
    unlinked: bool,
    read_only: bool,
}

impl std::fmt::Debug for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("id", &self.id)
            .field("size", &self.content.size())
            .field("dirty", &self.dirty)
            .field("unlinked", &self.unlinked)
            .finish_non_exhaustive()
    }
}

impl NodeState {
    pub fn kind(&self) -> FileKind {
        self.content.kind()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn stat(&self) -> NodeStat {
        let size = self.content.size();
        NodeStat {
            id: self.id,
            kind: self.kind(),
            size,
            blocks: raw_len_for_size(size).div_ceil(512),
            mode: self.meta.mode,
            uid: self.meta.uid,
            gid: self.meta.gid,
            nlink: self.meta.nlink,
            atime: self.meta.atime,
            mtime: self.meta.mtime,
            ctime: self.meta.ctime,
        }
    }

    /// Current metadata record.
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    // ---- content ----

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.require_file()?;
        self.content
            .read(offset, buf)
            .map_err(|e| FsError::from_codec(self.id, e))
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.require_file()?;
        self.content
            .write(offset, data)
            .map_err(|e| FsError::from_codec(self.id, e))?;
        self.touch_modified();
        Ok(data.len())
    }

    pub fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.require_file()?;
        self.content
            .resize(size)
            .map_err(|e| FsError::from_codec(self.id, e))?;
        self.touch_modified();
        Ok(())
    }

    /// Target of a symlink.
    pub fn read_link(&self) -> FsResult<PathBuf> {
        use std::os::unix::ffi::OsStringExt;

        if self.kind() != FileKind::Symlink {
            return Err(FsError::InvalidArgument(format!("{} is not a symlink", self.id)));
        }
        let raw = self
            .content
            .read_all()
            .map_err(|e| FsError::from_codec(self.id, e))?;
        Ok(PathBuf::from(std::ffi::OsString::from_vec(raw)))
    }

    /// Store a symlink target; only meaningful right after creation.
    pub fn write_link_target(&mut self, target: &[u8]) -> FsResult<()> {
        self.content
            .write(0, target)
            .map_err(|e| FsError::from_codec(self.id, e))
    }

    fn require_file(&self) -> FsResult<()> {
        match self.kind() {
            FileKind::RegularFile => Ok(()),
            FileKind::Directory => Err(FsError::IsADirectory(self.id.to_string())),
            FileKind::Symlink => Err(FsError::InvalidArgument(format!(
                "{} is a symlink",
                self.id
            ))),
        }
    }

    /// Persist metadata if it changed.
    pub fn flush(&mut self) -> FsResult<()> {
        if !self.dirty || self.read_only {
            return Ok(());
        }
        let sealed = seal_metadata(&self.meta, self.id, &self.content_key)
            .map_err(|e| FsError::from_codec(self.id, e))?;
        let meta_name = self.id.raw_meta_name();
        let tmp_name = meta_name.with_extension("meta.tmp");
        let tmp = self.storage.open_stream(
            &tmp_name,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o600,
        )?;
        tmp.write_all_at(&sealed, 0)?;
        drop(tmp);
        self.storage.rename(&tmp_name, &meta_name)?;
        self.dirty = false;
        trace!(id = %self.id, "Metadata flushed");
        Ok(())
    }

    /// Flush metadata, then push content to stable storage.
    pub fn fsync(&mut self, data_only: bool) -> FsResult<()> {
        self.flush()?;
        if self.read_only {
            return Ok(());
        }
        self.content
            .sync(data_only)
            .map_err(|e| FsError::from_codec(self.id, e))
    }

    // ---- metadata ----

    /// Replace permission bits, keeping the type bits.
    pub fn chmod(&mut self, perm: u32) {
        self.meta.mode = (self.meta.mode & libc::S_IFMT as u32) | (perm & 0o7777);
        self.touch_changed();
    }

    pub fn chown(&mut self, uid: Option<u32>, gid: Option<u32>) {
        if let Some(uid) = uid {
            self.meta.uid = uid;
        }
        if let Some(gid) = gid {
            self.meta.gid = gid;
        }
        self.touch_changed();
    }

    pub fn utimens(&mut self, atime: Option<SystemTime>, mtime: Option<SystemTime>) {
        if let Some(atime) = atime {
            self.meta.atime = atime;
        }
        if let Some(mtime) = mtime {
            self.meta.mtime = mtime;
        }
        self.touch_changed();
    }

    pub fn nlink(&self) -> u32 {
        self.meta.nlink
    }

    pub fn inc_nlink(&mut self) -> u32 {
        self.meta.nlink = self.meta.nlink.saturating_add(1);
        self.touch_changed();
        self.meta.nlink
    }

    /// Decrement the link count, returning the new value.
    pub fn dec_nlink(&mut self) -> u32 {
        self.meta.nlink = self.meta.nlink.saturating_sub(1);
        self.touch_changed();
        self.meta.nlink
    }

    /// Mark the object for reclamation once its last reference is closed.
    pub fn mark_unlinked(&mut self) {
        debug!(id = %self.id, "Node unlinked; storage reclaimed on last close");
        self.unlinked = true;
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }

    fn touch_changed(&mut self) {
        self.meta.ctime = SystemTime::now();
        self.dirty = true;
    }

    fn touch_modified(&mut self) {
        let now = SystemTime::now();
        self.meta.mtime = now;
        self.meta.ctime = now;
        self.dirty = true;
    }

    // ---- extended attributes ----

    pub fn list_xattrs(&self) -> Vec<String> {
        self.meta.xattrs.keys().cloned().collect()
    }

    pub fn get_xattr(&self, name: &str) -> FsResult<Vec<u8>> {
        self.meta
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NoAttribute(name.to_string()))
    }

    pub fn set_xattr(&mut self, name: &str, value: &[u8], mode: XattrMode) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidArgument(format!("bad xattr name {name:?}")));
        }
        let exists = self.meta.xattrs.contains_key(name);
        match mode {
            XattrMode::Create if exists => return Err(FsError::AlreadyExists(name.to_string())),
            XattrMode::Replace if !exists => return Err(FsError::NoAttribute(name.to_string())),
            _ => {}
        }
        self.meta.xattrs.insert(name.to_string(), value.to_vec());
        self.touch_changed();
        Ok(())
    }

    pub fn remove_xattr(&mut self, name: &str) -> FsResult<()> {
        self.meta
            .xattrs
            .remove(name)
            .ok_or_else(|| FsError::NoAttribute(name.to_string()))?;
        self.touch_changed();
        Ok(())
    }

    // ---- directory entries ----

    fn dir_entries(&self) -> FsResult<&BTreeMap<String, DirEntry>> {
        self.entries
            .as_ref()
            .ok_or_else(|| FsError::NotADirectory(self.id.to_string()))
    }

    /// All entries in name order.
    pub fn entries(&self) -> FsResult<&BTreeMap<String, DirEntry>> {
        self.dir_entries()
    }

    pub fn is_empty_dir(&self) -> FsResult<bool> {
        Ok(self.dir_entries()?.is_empty())
    }

    /// Exact-name lookup.
    pub fn get_entry(&self, name: &str) -> FsResult<Option<DirEntry>> {
        Ok(self.dir_entries()?.get(name).copied())
    }

    /// Look up `name`, returning the stored (case-preserved) name too.
    ///
    /// With `case_insensitive`, the first entry in byte order whose folded
    /// name equals the folded query wins.
    pub fn find_entry(
        &self,
        name: &str,
        case_insensitive: bool,
    ) -> FsResult<Option<(String, DirEntry)>> {
        let entries = self.dir_entries()?;
        if !case_insensitive {
            return Ok(entries.get(name).map(|e| (name.to_string(), *e)));
        }
        let wanted = fold_name(name);
        Ok(entries
            .iter()
            .find(|(stored, _)| fold_name(stored) == wanted)
            .map(|(stored, e)| (stored.clone(), *e)))
    }

    /// Insert a new entry and persist the directory.
    pub fn add_entry(&mut self, name: &str, entry: DirEntry, case_insensitive: bool) -> FsResult<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        self.require_linked()?;
        if self.find_entry(name, case_insensitive)?.is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        self.entries_mut()?.insert(name.to_string(), entry);
        self.persist_entries()
    }

    /// Remove the `remove` names and insert `insert`, persisting once.
    ///
    /// Names are matched exactly; missing ones are skipped. An existing
    /// entry under the inserted name is overwritten.
    pub fn swap_entries(
        &mut self,
        remove: &[&str],
        insert: Option<(&str, DirEntry)>,
    ) -> FsResult<()> {
        if let Some((name, _)) = insert {
            if name.len() > MAX_NAME_LEN {
                return Err(FsError::NameTooLong(name.to_string()));
            }
            self.require_linked()?;
        }
        let entries = self.entries_mut()?;
        for name in remove {
            entries.remove(*name);
        }
        if let Some((name, entry)) = insert {
            entries.insert(name.to_string(), entry);
        }
        self.persist_entries()
    }

    /// Remove the entry stored under exactly `name` and persist.
    pub fn remove_entry(&mut self, name: &str) -> FsResult<DirEntry> {
        let removed = self
            .entries_mut()?
            .remove(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        self.persist_entries()?;
        Ok(removed)
    }

    /// New entries cannot go into a removed directory.
    fn require_linked(&self) -> FsResult<()> {
        if self.unlinked {
            return Err(FsError::NotFound(format!("{} was removed", self.id)));
        }
        Ok(())
    }

    fn entries_mut(&mut self) -> FsResult<&mut BTreeMap<String, DirEntry>> {
        let id = self.id;
        self.entries
            .as_mut()
            .ok_or_else(|| FsError::NotADirectory(id.to_string()))
    }

    fn persist_entries(&mut self) -> FsResult<()> {
        let encoded = Zeroizing::new(encode_entries(self.dir_entries()?));
        self.content
            .write(0, &encoded)
            .and_then(|()| self.content.resize(encoded.len() as u64))
            .map_err(|e| FsError::from_codec(self.id, e))?;
        self.touch_modified();
        Ok(())
    }

    /// Final step of eviction: reclaim storage if unlinked, else flush.
    pub(crate) fn finalize(&mut self) -> FsResult<()> {
        if self.unlinked {
            if !self.read_only {
                self.storage.remove_file_nothrow(self.id.raw_name());
                self.storage.remove_file_nothrow(self.id.raw_meta_name());
                debug!(id = %self.id, "Reclaimed storage of unlinked node");
            }
            return Ok(());
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_node(dir: &TempDir, kind: FileKind) -> FileNode {
        let storage = OsStorage::new(dir.path());
        let key = MasterKey::generate();
        let id = FileId::random();
        FileNode::create(&storage, &key, id, kind, Metadata::new(kind, 0o644, 1, 1)).unwrap()
    }

    fn entry(kind: FileKind) -> DirEntry {
        DirEntry {
            id: FileId::random(),
            kind,
        }
    }

    #[test]
    fn fold_normalizes_and_lowercases() {
        assert_eq!(fold_name("Foo.TXT"), "foo.txt");
        // Decomposed e + combining acute folds like the precomposed form.
        assert_eq!(fold_name("Cafe\u{301}"), fold_name("caf\u{e9}"));
    }

    #[test]
    fn case_insensitive_lookup_prefers_first_in_byte_order() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::Directory);
        let mut state = node.lock();
        let upper = entry(FileKind::RegularFile);
        let lower = entry(FileKind::RegularFile);
        state.add_entry("README", upper, false).unwrap();
        state.add_entry("readme", lower, false).unwrap();

        let (stored, found) = state.find_entry("ReadMe", true).unwrap().unwrap();
        assert_eq!(stored, "README");
        assert_eq!(found, upper);
        assert!(state.find_entry("ReadMe", false).unwrap().is_none());
    }

    #[test]
    fn case_insensitive_add_rejects_fold_collision() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::Directory);
        let mut state = node.lock();
        state.add_entry("Foo.txt", entry(FileKind::RegularFile), true).unwrap();
        let err = state
            .add_entry("FOO.txt", entry(FileKind::RegularFile), true)
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[test]
    fn file_ops_reject_directories() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::Directory);
        let mut state = node.lock();
        assert!(matches!(state.write(0, b"x"), Err(FsError::IsADirectory(_))));
        assert!(matches!(state.truncate(0), Err(FsError::IsADirectory(_))));
    }

    #[test]
    fn entry_ops_reject_files() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::RegularFile);
        let state = node.lock();
        assert!(matches!(state.get_entry("x"), Err(FsError::NotADirectory(_))));
    }

    #[test]
    fn xattr_modes() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::RegularFile);
        let mut state = node.lock();
        assert!(matches!(
            state.set_xattr("user.a", b"1", XattrMode::Replace),
            Err(FsError::NoAttribute(_))
        ));
        state.set_xattr("user.a", b"1", XattrMode::Create).unwrap();
        assert!(matches!(
            state.set_xattr("user.a", b"2", XattrMode::Create),
            Err(FsError::AlreadyExists(_))
        ));
        state.set_xattr("user.a", b"3", XattrMode::Replace).unwrap();
        assert_eq!(state.get_xattr("user.a").unwrap(), b"3");
        assert_eq!(state.list_xattrs(), vec!["user.a".to_string()]);
        state.remove_xattr("user.a").unwrap();
        assert!(matches!(state.get_xattr("user.a"), Err(FsError::NoAttribute(_))));
    }

    #[test]
    fn chmod_keeps_type_bits() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::RegularFile);
        let mut state = node.lock();
        state.chmod(0o600);
        let stat = state.stat();
        assert_eq!(stat.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
        assert_eq!(stat.mode & 0o7777, 0o600);
        assert!(state.is_dirty());
        state.flush().unwrap();
        assert!(!state.is_dirty());
    }

    #[test]
    fn write_extends_size() {
        let dir = TempDir::new().unwrap();
        let node = new_node(&dir, FileKind::RegularFile);
        let mut state = node.lock();
        state.write(10_000, b"tail").unwrap();
        assert_eq!(state.stat().size, 10_004);
        let mut buf = [0xffu8; 4];
        state.read(5000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }
}
