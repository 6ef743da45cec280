//! Free-space-aware root selection.

use std::io;
use std::path::Path;

use super::Pool;

/// Source of free-space numbers for a backing root. Production uses
/// [`StatvfsProbe`]; tests script capacities without filling disks.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to writers on the filesystem holding `root`
    /// (`block_size * available_blocks`). Queried on demand, never cached.
    fn available(&self, root: &Path) -> io::Result<u64>;
}

pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available(&self, root: &Path) -> io::Result<u64> {
        let st = nix::sys::statvfs::statvfs(root)?;
        Ok(st.block_size() as u64 * st.blocks_available() as u64)
    }
}

impl Pool {
    /// Picks the root that should receive `required` new bytes.
    ///
    /// Evaluated in configuration order: the first root whose free space
    /// covers `required` plus the configured headroom is taken immediately;
    /// otherwise the root with the single greatest free space wins, provided
    /// it still strictly exceeds `required`. `None` means the whole pool is
    /// out of space.
    pub fn choose_root(&self, required: u64) -> Option<usize> {
        let limit = self.config.move_limit();
        let mut fallback: Option<(usize, u64)> = None;

        for (index, root) in self.config.roots().iter().enumerate() {
            let avail = match self.probe.available(root) {
                Ok(avail) => avail,
                Err(e) => {
                    warn!("statvfs failed for {}: {e}", root.display());
                    continue;
                }
            };
            if avail >= required.saturating_add(limit) {
                return Some(index);
            }
            if avail > required && fallback.is_none_or(|(_, best)| best < avail) {
                fallback = Some((index, avail));
            }
        }
        fallback.map(|(index, _)| index)
    }
}
