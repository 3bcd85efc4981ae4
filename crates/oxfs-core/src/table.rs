//! The open-file identity cache.
//!
//! # Invariants
//!
//! - At most one [`FileNode`] exists per [`FileId`] at any instant.
//! - A node's refcount equals opens minus closes routed through this table.
//! - The last close flushes (or reclaims, if unlinked) and evicts the node
//!   as one step. A racing open either reuses the node before that step
//!   starts or constructs a fresh one after it finishes.
//!
//! # Locking
//!
//! The registry is a `DashMap` from id to a per-identifier slot. Registry
//! operations hold a shard lock only for the insert/lookup/remove itself.
//! Construction and eviction I/O run under the slot's mutex, so work on
//! unrelated identifiers never serializes. A slot is retired (and removed
//! from the registry) while its mutex is held; a thread that locks a
//! retired slot retries with a fresh one.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{FileKind, Metadata};
use crate::error::{FsError, FsResult};
use crate::id::FileId;
use crate::key::MasterKey;
use crate::node::FileNode;
use crate::storage::OsStorage;

#[derive(Debug, Default)]
struct NodeSlot {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    node: Option<Arc<FileNode>>,
    /// Removed from the registry; never reused.
    retired: bool,
}

/// Registry of every live encrypted object.
#[derive(Debug)]
pub struct FileTable {
    storage: OsStorage,
    key: MasterKey,
    read_only: bool,
    slots: DashMap<FileId, Arc<NodeSlot>>,
}

impl FileTable {
    pub fn new(storage: OsStorage, key: MasterKey) -> Self {
        Self {
            storage,
            key,
            read_only: false,
            slots: DashMap::new(),
        }
    }

    /// A table whose nodes open raw storage read-only and never persist.
    pub fn new_read_only(storage: OsStorage, key: MasterKey) -> Self {
        Self {
            read_only: true,
            ..Self::new(storage, key)
        }
    }

    pub fn storage(&self) -> &OsStorage {
        &self.storage
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Return the live node for `id`, opening its storage if needed.
    ///
    /// Takes one reference; pair with [`close`](Self::close).
    pub fn open_as(&self, id: FileId, kind_hint: Option<FileKind>) -> FsResult<Arc<FileNode>> {
        self.acquire(id, |table| {
            FileNode::open(&table.storage, &table.key, id, kind_hint, table.read_only)
        }, true)
    }

    /// Create storage for a brand-new object and return its node.
    ///
    /// Fails with `AlreadyExists` if `id` is live or already on disk.
    pub fn create_as(
        &self,
        id: FileId,
        kind: FileKind,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Arc<FileNode>> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        self.acquire(id, |table| {
            let meta = Metadata::new(kind, mode, uid, gid);
            FileNode::create(&table.storage, &table.key, id, kind, meta)
        }, false)
    }

    fn acquire(
        &self,
        id: FileId,
        construct: impl Fn(&Self) -> FsResult<FileNode>,
        reuse: bool,
    ) -> FsResult<Arc<FileNode>> {
        loop {
            let slot = Arc::clone(self.slots.entry(id).or_default().value());
            let mut state = slot.state.lock();
            if state.retired {
                trace!(id = %id, "Slot retired during open, retrying");
                continue;
            }
            if let Some(node) = &state.node {
                if !reuse {
                    return Err(FsError::AlreadyExists(id.to_string()));
                }
                let count = node.refcount.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(id = %id, refcount = count, "Reused live node");
                return Ok(Arc::clone(node));
            }

            return match construct(self) {
                Ok(node) => {
                    node.refcount.store(1, Ordering::Release);
                    let node = Arc::new(node);
                    state.node = Some(Arc::clone(&node));
                    Ok(node)
                }
                Err(e) => {
                    state.retired = true;
                    self.slots.remove_if(&id, |_, s| Arc::ptr_eq(s, &slot));
                    Err(e)
                }
            };
        }
    }

    /// Drop one reference. The last one flushes and evicts the node,
    /// reclaiming its storage if it was unlinked.
    ///
    /// A flush failure is returned, but the node is evicted regardless.
    pub fn close(&self, node: &Arc<FileNode>) -> FsResult<()> {
        let id = node.id();
        let slot = self
            .slots
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| self.invariant(id, "close of a node missing from the registry"))?;
        let mut state = slot.state.lock();
        match &state.node {
            Some(live) if Arc::ptr_eq(live, node) => {}
            _ => return Err(self.invariant(id, "close of a node that is not the live one")),
        }

        let previous = node.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "refcount underflow");
        if previous == 0 {
            node.refcount.store(0, Ordering::Release);
            return Err(self.invariant(id, "refcount underflow"));
        }
        if previous > 1 {
            trace!(id = %id, refcount = previous - 1, "Released reference");
            return Ok(());
        }

        let result = node.lock().finalize();
        if let Err(e) = &result {
            warn!(id = %id, error = %e, "Flush failed during eviction");
        }
        state.node = None;
        state.retired = true;
        self.slots.remove_if(&id, |_, s| Arc::ptr_eq(s, &slot));
        debug!(id = %id, "Evicted node");
        result
    }

    /// Flush and drop every live node regardless of refcount. Used at unmount.
    ///
    /// Returns the number of nodes evicted. Errors are logged per node.
    pub fn evict_all(&self) -> usize {
        let slots: Vec<(FileId, Arc<NodeSlot>)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        let mut evicted = 0;
        for (id, slot) in slots {
            let mut state = slot.state.lock();
            if state.retired {
                continue;
            }
            if let Some(node) = state.node.take() {
                let refs = node.refcount.swap(0, Ordering::AcqRel);
                if refs > 0 {
                    debug!(id = %id, refcount = refs, "Evicting node with open references");
                }
                if let Err(e) = node.lock().finalize() {
                    warn!(id = %id, error = %e, "Flush failed during shutdown eviction");
                }
                evicted += 1;
            }
            state.retired = true;
            self.slots.remove_if(&id, |_, s| Arc::ptr_eq(s, &slot));
        }
        if evicted > 0 {
            info!(count = evicted, "Evicted all live nodes");
        }
        evicted
    }

    /// Number of live nodes.
    pub fn live_count(&self) -> usize {
        // Slot mutexes are never taken under a shard guard.
        let slots: Vec<Arc<NodeSlot>> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        slots
            .iter()
            .filter(|slot| slot.state.lock().node.is_some())
            .count()
    }

    /// The live node for `id`, if any, without taking a reference.
    pub fn lookup_live(&self, id: FileId) -> Option<Arc<FileNode>> {
        let slot = self.slots.get(&id).map(|s| Arc::clone(s.value()))?;
        let state = slot.state.lock();
        state.node.clone()
    }

    /// Open `id` behind a guard that closes on drop.
    pub fn open_ref(&self, id: FileId, kind_hint: Option<FileKind>) -> FsResult<NodeRef<'_>> {
        self.open_as(id, kind_hint).map(|node| NodeRef::new(self, node))
    }

    fn invariant(&self, id: FileId, what: &str) -> FsError {
        error!(id = %id, "{what}");
        FsError::InvariantViolation(format!("{what} ({id})"))
    }
}

/// One reference to a live node, closed when dropped.
#[derive(Debug)]
pub struct NodeRef<'a> {
    table: &'a FileTable,
    node: Option<Arc<FileNode>>,
}

impl<'a> NodeRef<'a> {
    /// Wrap a reference already taken with [`FileTable::open_as`] or
    /// [`FileTable::create_as`].
    pub fn new(table: &'a FileTable, node: Arc<FileNode>) -> Self {
        Self {
            table,
            node: Some(node),
        }
    }

    /// The shared node. Cloning it does not take a table reference.
    pub fn node(&self) -> &Arc<FileNode> {
        self.node.as_ref().unwrap_or_else(|| unreachable!("NodeRef used after release"))
    }

    /// Close now, reporting any flush error.
    pub fn release(mut self) -> FsResult<()> {
        match self.node.take() {
            Some(node) => self.table.close(&node),
            None => Ok(()),
        }
    }

    /// Hand the reference to the caller, who becomes responsible for closing it.
    pub fn into_inner(mut self) -> Arc<FileNode> {
        self.node
            .take()
            .unwrap_or_else(|| unreachable!("NodeRef used after release"))
    }
}

impl Deref for NodeRef<'_> {
    type Target = FileNode;

    fn deref(&self) -> &FileNode {
        self.node()
    }
}

impl Drop for NodeRef<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take()
            && let Err(e) = self.table.close(&node)
        {
            warn!(id = %node.id(), error = %e, "Close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(dir: &TempDir) -> FileTable {
        FileTable::new(OsStorage::new(dir.path()), MasterKey::generate())
    }

    #[test]
    fn reopen_shares_one_node() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let id = FileId::random();
        let a = table.create_as(id, FileKind::RegularFile, 0o644, 0, 0).unwrap();
        let b = table.open_as(id, Some(FileKind::RegularFile)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        assert_eq!(table.live_count(), 1);

        table.close(&b).unwrap();
        assert_eq!(a.refcount(), 1);
        table.close(&a).unwrap();
        assert_eq!(table.live_count(), 0);
        assert!(table.lookup_live(id).is_none());
    }

    #[test]
    fn data_survives_eviction() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let id = FileId::random();
        {
            let node = NodeRef::new(
                &table,
                table.create_as(id, FileKind::RegularFile, 0o600, 0, 0).unwrap(),
            );
            node.lock().write(0, b"persisted").unwrap();
            node.lock().set_xattr("user.k", b"v", Default::default()).unwrap();
        }
        assert_eq!(table.live_count(), 0);

        let node = table.open_ref(id, None).unwrap();
        let state = node.lock();
        let mut buf = [0u8; 9];
        assert_eq!(state.read(0, &mut buf).unwrap(), 9);
        assert_eq!(&buf, b"persisted");
        assert_eq!(state.get_xattr("user.k").unwrap(), b"v");
        assert_eq!(state.stat().mode & 0o777, 0o600);
    }

    #[test]
    fn create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let id = FileId::random();
        let node = table.create_as(id, FileKind::RegularFile, 0o644, 0, 0).unwrap();
        assert!(matches!(
            table.create_as(id, FileKind::RegularFile, 0o644, 0, 0),
            Err(FsError::AlreadyExists(_))
        ));
        table.close(&node).unwrap();
        assert!(matches!(
            table.create_as(id, FileKind::RegularFile, 0o644, 0, 0),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn missing_object_is_not_found_and_leaves_no_slot() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        assert!(matches!(
            table.open_as(FileId::random(), None),
            Err(FsError::NotFound(_))
        ));
        assert_eq!(table.slots.len(), 0);
    }

    #[test]
    fn wrong_kind_hint_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let id = FileId::random();
        let node = table.create_as(id, FileKind::RegularFile, 0o644, 0, 0).unwrap();
        table.close(&node).unwrap();
        let err = table.open_as(id, Some(FileKind::Directory)).unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn unlinked_node_is_reclaimed_on_last_close() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let id = FileId::random();
        let node = table.create_as(id, FileKind::RegularFile, 0o644, 0, 0).unwrap();
        node.lock().mark_unlinked();
        assert!(table.storage().exists(id.raw_name()));
        table.close(&node).unwrap();
        assert!(!table.storage().exists(id.raw_name()));
        assert!(!table.storage().exists(id.raw_meta_name()));
    }

    #[test]
    fn close_of_stale_node_is_invariant_violation() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let id = FileId::random();
        let node = table.create_as(id, FileKind::RegularFile, 0o644, 0, 0).unwrap();
        table.close(&node).unwrap();
        assert!(matches!(table.close(&node), Err(FsError::InvariantViolation(_))));
    }

    #[test]
    fn evict_all_ignores_refcounts() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let a = table
            .create_as(FileId::random(), FileKind::RegularFile, 0o644, 0, 0)
            .unwrap();
        let _again = table.open_as(a.id(), None).unwrap();
        let _b = table
            .create_as(FileId::random(), FileKind::Directory, 0o755, 0, 0)
            .unwrap();
        assert_eq!(table.evict_all(), 2);
        assert_eq!(table.live_count(), 0);
        assert_eq!(a.refcount(), 0);
    }

    #[test]
    fn read_only_table_refuses_create() {
        let dir = TempDir::new().unwrap();
        let table = FileTable::new_read_only(OsStorage::new(dir.path()), MasterKey::generate());
        assert!(table.is_read_only());
        assert!(matches!(
            table.create_as(FileId::random(), FileKind::RegularFile, 0o644, 0, 0),
            Err(FsError::ReadOnly)
        ));
    }
}
