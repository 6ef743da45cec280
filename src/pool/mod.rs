//! Multi-root path resolution and placement.
//!
//! A virtual path is namespace-relative (`/a/b.txt`); a physical path is that
//! path joined onto one specific backing root. At any quiescent moment at
//! most one root holds a given virtual path; when several do (a union
//! inconsistency the pool tolerates but does not repair), the lowest root
//! index wins everywhere.

mod mirror;
mod placement;

pub use placement::{SpaceProbe, StatvfsProbe};

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PoolConfig;

pub struct Pool {
    config: Arc<PoolConfig>,
    probe: Box<dyn SpaceProbe>,
}

impl Pool {
    pub fn new(config: Arc<PoolConfig>) -> Self {
        Self::with_probe(config, Box::new(StatvfsProbe))
    }

    /// Swaps the statvfs-backed probe for a scripted one; test seam.
    pub fn with_probe(config: Arc<PoolConfig>, probe: Box<dyn SpaceProbe>) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn probe(&self) -> &dyn SpaceProbe {
        self.probe.as_ref()
    }

    /// Joins a virtual path onto a root. Pure: strips leading separators
    /// from the virtual path, inserts exactly one separator, and strips a
    /// trailing separator unless the result is the root itself. Operates on
    /// raw bytes; names need not be UTF-8.
    pub fn join(root: &Path, virtual_path: impl AsRef<Path>) -> PathBuf {
        let mut bytes = virtual_path.as_ref().as_os_str().as_bytes();
        while let Some(rest) = bytes.strip_prefix(b"/") {
            bytes = rest;
        }
        while let Some(rest) = bytes.strip_suffix(b"/") {
            bytes = rest;
        }
        if bytes.is_empty() {
            root.to_path_buf()
        } else {
            root.join(OsStr::from_bytes(bytes))
        }
    }

    /// Finds the first root (in configuration order) physically holding
    /// `virtual_path`. Link-aware: a dangling symlink still resolves.
    pub fn resolve(&self, virtual_path: impl AsRef<Path>) -> Option<(usize, PathBuf)> {
        let virtual_path = virtual_path.as_ref();
        for (index, root) in self.config.roots().iter().enumerate() {
            let physical = Self::join(root, virtual_path);
            if physical.symlink_metadata().is_ok() {
                return Some((index, physical));
            }
        }
        None
    }

    /// Like [`Pool::resolve`] but only reports the owning root index.
    pub fn resolve_root(&self, virtual_path: impl AsRef<Path>) -> Option<usize> {
        self.resolve(virtual_path).map(|(index, _)| index)
    }
}
