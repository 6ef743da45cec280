//! Open-handle registry.
//!
//! Tracks every open virtual file: its caller-visible id, the physical file
//! currently backing it, and the flags it was opened with. The entry table is
//! guarded by one reader/writer lock; writers first take a small ordering
//! mutex for the instant of acquiring write mode so a burst of upgraders
//! cannot starve readers. On top of that, a keyed per-virtual-path lock lets
//! the relocation engine exclude reads and writes on exactly the handles it
//! is repointing while unrelated paths stay fully concurrent.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use crate::error::{Error, Result};

/// One caller-visible open file. Multiple handles may share a virtual path
/// (concurrent opens); each carries its own descriptor and seek position.
pub struct Handle {
    id: u64,
    virtual_path: PathBuf,
    flags: u32,
    state: Mutex<HandleState>,
}

/// The mutable half of a handle. Swapped exactly once per relocation, under
/// the per-path exclusive lock; everyone else only reads through it.
pub struct HandleState {
    pub physical_path: PathBuf,
    pub file: File,
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn virtual_path(&self) -> &Path {
        &self.virtual_path
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap()
    }
}

type EntryMap = HashMap<u64, Arc<Handle>>;

pub struct HandleRegistry {
    entries: RwLock<EntryMap>,
    /// Ordering mutex taken just before the write lock (and released as soon
    /// as it is held) so concurrent upgraders queue here instead of spinning
    /// against readers.
    write_gate: Mutex<()>,
    /// Cursor for id allocation; ids skip zero and anything still live.
    id_cursor: Mutex<u64>,
    path_locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
            id_cursor: Mutex::new(0),
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, EntryMap> {
        let gate = self.write_gate.lock().unwrap();
        let entries = self.entries.write().unwrap();
        drop(gate);
        entries
    }

    fn next_id(&self, entries: &EntryMap) -> u64 {
        let mut cursor = self.id_cursor.lock().unwrap();
        loop {
            *cursor = cursor.wrapping_add(1);
            if *cursor == 0 {
                continue;
            }
            if !entries.contains_key(&*cursor) {
                return *cursor;
            }
        }
    }

    /// Registers an open file and returns its fresh id.
    pub fn open(
        &self,
        virtual_path: impl AsRef<Path>,
        physical_path: PathBuf,
        flags: u32,
        file: File,
    ) -> u64 {
        let virtual_path = virtual_path.as_ref();
        let mut entries = self.write_entries();
        let id = self.next_id(&entries);
        debug!(
            "open {} ({}) id={id}",
            virtual_path.display(),
            physical_path.display()
        );
        entries.insert(
            id,
            Arc::new(Handle {
                id,
                virtual_path: virtual_path.to_path_buf(),
                flags,
                state: Mutex::new(HandleState {
                    physical_path,
                    file,
                }),
            }),
        );
        id
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Handle>> {
        self.entries.read().unwrap().get(&id).cloned()
    }

    /// Every live handle sharing `virtual_path`, in id order. Used by the
    /// relocation engine to repoint siblings together.
    pub fn lookup_all_by_virtual_path(&self, virtual_path: impl AsRef<Path>) -> Vec<Arc<Handle>> {
        let virtual_path = virtual_path.as_ref();
        let entries = self.entries.read().unwrap();
        let mut found: Vec<Arc<Handle>> = entries
            .values()
            .filter(|h| h.virtual_path == virtual_path)
            .cloned()
            .collect();
        found.sort_by_key(|h| h.id);
        found
    }

    /// Removes the entry; the native descriptor closes when the last
    /// reference to the handle drops.
    pub fn close(&self, id: u64) -> Option<Arc<Handle>> {
        let mut entries = self.write_entries();
        let handle = entries.remove(&id)?;
        debug!("close {} id={id}", handle.virtual_path.display());
        let orphaned = !entries
            .values()
            .any(|h| h.virtual_path == handle.virtual_path);
        drop(entries);
        if orphaned {
            self.path_locks.lock().unwrap().remove(&handle.virtual_path);
        }
        Some(handle)
    }

    /// The keyed lock for one virtual path. Readers/writers on the path hold
    /// it shared; a relocation holds it exclusive for its whole span.
    pub fn path_lock(&self, virtual_path: impl AsRef<Path>) -> Arc<RwLock<()>> {
        self.path_locks
            .lock()
            .unwrap()
            .entry(virtual_path.as_ref().to_path_buf())
            .or_default()
            .clone()
    }

    pub fn read_at(&self, id: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        let handle = self.lookup(id).ok_or_else(bad_handle)?;
        let lock = self.path_lock(&handle.virtual_path);
        let _shared = lock.read().unwrap();
        let state = handle.state();
        Ok(state.file.read_at(buf, offset)?)
    }

    pub fn write_at(&self, id: u64, data: &[u8], offset: u64) -> Result<usize> {
        let handle = self.lookup(id).ok_or_else(bad_handle)?;
        let lock = self.path_lock(&handle.virtual_path);
        let _shared = lock.read().unwrap();
        let state = handle.state();
        Ok(state.file.write_at(data, offset)?)
    }

    pub fn fsync(&self, id: u64, datasync: bool) -> Result<()> {
        let handle = self.lookup(id).ok_or_else(bad_handle)?;
        let state = handle.state();
        if datasync {
            state.file.sync_data()?;
        } else {
            state.file.sync_all()?;
        }
        Ok(())
    }

    pub fn set_len(&self, id: u64, size: u64) -> Result<()> {
        let handle = self.lookup(id).ok_or_else(bad_handle)?;
        let lock = self.path_lock(&handle.virtual_path);
        let _shared = lock.read().unwrap();
        let state = handle.state();
        Ok(state.file.set_len(size)?)
    }
}

fn bad_handle() -> Error {
    Error::Io(io::Error::from_raw_os_error(libc::EBADF))
}
