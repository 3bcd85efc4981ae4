//! Mapping from the kernel's opaque file handles to open nodes.
//!
//! Each `open`/`create`/`opendir` takes one file-table reference and parks
//! it here under a fresh handle id. The id is what the kernel sees; the
//! node is only reachable through this table. `release` removes the entry
//! and hands the reference back for closing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use oxfs_core::FileNode;

/// One open handle.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub node: Arc<FileNode>,
    /// Flags passed to `open`/`create`.
    pub flags: i32,
}

impl OpenFile {
    pub fn new(node: Arc<FileNode>, flags: i32) -> Self {
        Self { node, flags }
    }

    /// Whether the handle was opened for writing.
    pub fn writable(&self) -> bool {
        matches!(self.flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
    }
}

/// Thread-safe handle table with auto-incrementing ids.
///
/// Ids start at 1; 0 is never issued.
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, OpenFile>,
    next_id: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a handle under a fresh id.
    pub fn insert_auto(&self, file: OpenFile) -> u64 {
        let mut file = Some(file);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id)
                && let Some(file) = file.take()
            {
                entry.insert(file);
                return id;
            }
        }
    }

    /// A copy of the handle; no dashmap guard outlives the call.
    pub fn get(&self, fh: u64) -> Option<OpenFile> {
        self.handles.get(&fh).map(|h| h.value().clone())
    }

    pub fn remove(&self, fh: u64) -> Option<OpenFile> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }

    /// Remove and return every handle.
    pub fn drain(&self) -> Vec<OpenFile> {
        let ids: Vec<u64> = self.handles.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxfs_core::{FileId, FileKind, FileTable, MasterKey, OsStorage};
    use std::thread;
    use tempfile::TempDir;

    fn node(table: &FileTable) -> Arc<FileNode> {
        table
            .create_as(FileId::random(), FileKind::RegularFile, 0o644, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let dir = TempDir::new().unwrap();
        let files = FileTable::new(OsStorage::new(dir.path()), MasterKey::generate());
        let handles = HandleTable::new();
        let a = handles.insert_auto(OpenFile::new(node(&files), libc::O_RDONLY));
        let b = handles.insert_auto(OpenFile::new(node(&files), libc::O_RDWR));
        assert_eq!((a, b), (1, 2));
        assert!(!handles.get(a).unwrap().writable());
        assert!(handles.get(b).unwrap().writable());

        assert!(handles.remove(a).is_some());
        assert!(handles.remove(a).is_none());
        assert_eq!(handles.len(), 1);
        assert_eq!(handles.drain().len(), 1);
        assert!(handles.is_empty());
        files.evict_all();
    }

    #[test]
    fn test_concurrent_inserts_get_unique_ids() {
        let dir = TempDir::new().unwrap();
        let files = Arc::new(FileTable::new(
            OsStorage::new(dir.path()),
            MasterKey::generate(),
        ));
        let shared = node(&files);
        let handles = Arc::new(HandleTable::new());

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let handles = Arc::clone(&handles);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    (0..50)
                        .map(|_| handles.insert_auto(OpenFile::new(Arc::clone(&shared), 0)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u64> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        files.evict_all();
    }
}
