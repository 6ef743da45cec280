//! Inode <-> virtual path bookkeeping for the FUSE adapter.
//!
//! The kernel addresses everything by inode while the pool core is path
//! addressed. Inode 1 is the namespace root; numbers are assigned on first
//! sight of a path and stay stable until the path is unlinked or renamed.
//! Paths are kept as raw `PathBuf`s so names never have to be valid UTF-8.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const ROOT_INODE: u64 = 1;

struct Tables {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next: u64,
}

pub struct InodeTable {
    inner: Mutex<Tables>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(ROOT_INODE, PathBuf::from("/"));
        inodes.insert(PathBuf::from("/"), ROOT_INODE);
        Self {
            inner: Mutex::new(Tables {
                paths,
                inodes,
                next: ROOT_INODE + 1,
            }),
        }
    }

    /// The virtual path currently known for `ino`.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inner.lock().unwrap().paths.get(&ino).cloned()
    }

    /// The inode for `path`, assigning a fresh one on first sight.
    pub fn ino_of(&self, path: impl AsRef<Path>) -> u64 {
        let path = path.as_ref();
        let mut tables = self.inner.lock().unwrap();
        if let Some(&ino) = tables.inodes.get(path) {
            return ino;
        }
        let ino = tables.next;
        tables.next += 1;
        tables.paths.insert(ino, path.to_path_buf());
        tables.inodes.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drops the mapping for an unlinked path.
    pub fn forget_path(&self, path: impl AsRef<Path>) {
        let mut tables = self.inner.lock().unwrap();
        if let Some(ino) = tables.inodes.remove(path.as_ref()) {
            tables.paths.remove(&ino);
        }
    }

    /// Repoints `old` (and, for directories, everything under it) to `new`,
    /// keeping inode numbers stable across the rename.
    pub fn rename(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) {
        let (old, new) = (old.as_ref(), new.as_ref());
        let mut tables = self.inner.lock().unwrap();
        let affected: Vec<(PathBuf, u64)> = tables
            .inodes
            .iter()
            .filter(|(p, _)| p.starts_with(old))
            .map(|(p, &i)| (p.clone(), i))
            .collect();
        for (path, ino) in affected {
            let renamed = match path.strip_prefix(old) {
                Ok(rest) if rest.as_os_str().is_empty() => new.to_path_buf(),
                Ok(rest) => new.join(rest),
                Err(_) => continue,
            };
            tables.inodes.remove(&path);
            tables.inodes.insert(renamed.clone(), ino);
            tables.paths.insert(ino, renamed);
        }
    }
}
