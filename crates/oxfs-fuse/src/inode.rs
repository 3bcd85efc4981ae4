//! Inode numbers for the kernel.
//!
//! The path-based operations know nothing about inodes. This table hands out
//! a stable number per path, tracks the kernel's lookup count, and follows
//! renames so that an inode keeps pointing at its object after a move.
//!
//! Both maps live behind one lock: a directory rename rewrites every
//! descendant path and must not be observed half done.
//!
//! An inode whose name is unlinked or replaced is detached: it stays
//! allocated until the kernel forgets it, but no longer resolves to a path,
//! so it can never reach an object that later took the same name.

use std::collections::HashMap;

use parking_lot::RwLock;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

#[derive(Debug)]
struct InodeEntry {
    path: String,
    /// Outstanding kernel lookups.
    nlookup: u64,
    /// The name no longer refers to this inode's object.
    detached: bool,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<u64, InodeEntry>,
    paths: HashMap<String, u64>,
    next_inode: u64,
}

/// Bidirectional inode/path mapping with lookup counting.
#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        let mut paths = HashMap::new();
        entries.insert(
            ROOT_INODE,
            InodeEntry {
                path: "/".to_string(),
                nlookup: 1,
                detached: false,
            },
        );
        paths.insert("/".to_string(), ROOT_INODE);
        Self {
            inner: RwLock::new(Inner {
                entries,
                paths,
                next_inode: ROOT_INODE + 1,
            }),
        }
    }

    /// Path currently bound to `ino`. `None` once the inode is detached.
    pub fn path(&self, ino: u64) -> Option<String> {
        self.inner
            .read()
            .entries
            .get(&ino)
            .filter(|e| !e.detached)
            .map(|e| e.path.clone())
    }

    /// Whether `ino` is still allocated but has lost its name.
    pub fn is_detached(&self, ino: u64) -> bool {
        self.inner.read().entries.get(&ino).is_some_and(|e| e.detached)
    }

    pub fn inode(&self, path: &str) -> Option<u64> {
        self.inner.read().paths.get(path).copied()
    }

    /// Inode for `path`, allocating if needed, and count one kernel lookup.
    pub fn get_or_insert(&self, path: &str) -> u64 {
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.paths.get(path) {
            if let Some(entry) = inner.entries.get_mut(&ino) {
                entry.nlookup += 1;
            }
            return ino;
        }
        let ino = inner.next_inode;
        inner.next_inode += 1;
        inner.entries.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                nlookup: 1,
                detached: false,
            },
        );
        inner.paths.insert(path.to_string(), ino);
        ino
    }

    /// Drop `nlookup` kernel references. The entry goes away at zero; the
    /// root never does.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(&ino) else {
            return;
        };
        entry.nlookup = entry.nlookup.saturating_sub(nlookup);
        if entry.nlookup > 0 {
            return;
        }
        if let Some(entry) = inner.entries.remove(&ino)
            && inner.paths.get(&entry.path) == Some(&ino)
        {
            inner.paths.remove(&entry.path);
        }
    }

    /// Detach `path` and anything below it after unlink/rmdir. The inodes
    /// stay allocated until forgotten.
    pub fn invalidate_path(&self, path: &str) {
        let mut inner = self.inner.write();
        let Inner { entries, paths, .. } = &mut *inner;
        detach_within(entries, paths, path);
    }

    /// Follow a rename: `from` and everything below it move under `to`.
    /// Whatever was bound at `to` is unbound.
    pub fn rename(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let mut inner = self.inner.write();
        let Inner { entries, paths, .. } = &mut *inner;

        detach_within(entries, paths, to);

        let moved: Vec<(String, u64)> = paths
            .iter()
            .filter(|(p, _)| is_within(p, from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            paths.remove(&old);
            let new = format!("{to}{}", &old[from.len()..]);
            if let Some(entry) = entries.get_mut(&ino) {
                entry.path.clone_from(&new);
            }
            paths.insert(new, ino);
        }
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn detach_within(
    entries: &mut HashMap<u64, InodeEntry>,
    paths: &mut HashMap<String, u64>,
    base: &str,
) {
    let gone: Vec<String> = paths
        .keys()
        .filter(|p| is_within(p, base))
        .cloned()
        .collect();
    for path in gone {
        if let Some(ino) = paths.remove(&path)
            && let Some(entry) = entries.get_mut(&ino)
        {
            entry.detached = true;
        }
    }
}

/// `path` equals `base` or lies beneath it.
fn is_within(path: &str, base: &str) -> bool {
    path == base
        || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
