//! Ancestor-directory mirroring.
//!
//! Before a file or directory can be materialized on a root, its ancestor
//! chain must exist there. Missing ancestors are cloned (mode, owner, group)
//! from wherever each one already lives in the namespace.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use super::Pool;
use crate::error::{Error, Result};

impl Pool {
    /// Mirrors the missing ancestors of `virtual_path` onto `root_index`,
    /// shallowest first. Idempotent: ancestors already present on the root
    /// are skipped.
    ///
    /// The whole chain is validated against the namespace before anything is
    /// created; if any ancestor exists on no root, this fails with
    /// [`Error::AncestorMissing`] and the target root is left untouched.
    pub fn ensure_ancestors(&self, root_index: usize, virtual_path: impl AsRef<Path>) -> Result<()> {
        let root = self.config().root(root_index);

        let mut pending: Vec<(PathBuf, PathBuf)> = Vec::new();
        for ancestor in ancestor_chain(virtual_path.as_ref()) {
            let physical = Pool::join(root, ancestor);
            if physical.symlink_metadata().is_ok() {
                continue;
            }
            let (_, source) = self.resolve(ancestor).ok_or(Error::AncestorMissing)?;
            pending.push((physical, source));
        }

        for (physical, source) in pending {
            let st = fs::metadata(&source)?;
            debug!(
                "mirror {} -> {} (mode {:o})",
                source.display(),
                physical.display(),
                st.mode()
            );
            nix::unistd::mkdir(&physical, Mode::from_bits_truncate(st.mode()))?;
            nix::unistd::chown(
                &physical,
                Some(Uid::from_raw(st.uid())),
                Some(Gid::from_raw(st.gid())),
            )?;
            // mkdir is subject to the umask; re-apply the exact source mode.
            fs::set_permissions(&physical, fs::Permissions::from_mode(st.mode()))?;
        }
        Ok(())
    }
}

/// Proper ancestors of a virtual path, shallowest first, excluding the root
/// itself and the leaf: `/a/b/c.txt` yields `/a`, `/a/b`.
fn ancestor_chain(virtual_path: &Path) -> Vec<&Path> {
    let mut chain: Vec<&Path> = virtual_path
        .ancestors()
        .skip(1)
        .filter(|p| *p != Path::new("/") && !p.as_os_str().is_empty())
        .collect();
    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MOVE_LIMIT, PoolConfig};
    use std::path::Path;
    use std::sync::Arc;

    fn pool(roots: &[&Path]) -> Pool {
        let cfg = PoolConfig::new(
            roots.iter().map(|p| p.to_path_buf()).collect(),
            DEFAULT_MOVE_LIMIT,
        )
        .unwrap();
        Pool::new(Arc::new(cfg))
    }

    #[test]
    fn ancestor_chain_shape() {
        assert_eq!(
            ancestor_chain(Path::new("/a/b/c.txt")),
            vec![Path::new("/a"), Path::new("/a/b")]
        );
        assert!(ancestor_chain(Path::new("/top.txt")).is_empty());
        assert!(ancestor_chain(Path::new("/")).is_empty());
    }

    #[test]
    fn mirrors_chain_with_source_modes() {
        let r0 = tempfile::tempdir().unwrap();
        let r1 = tempfile::tempdir().unwrap();
        let pool = pool(&[r0.path(), r1.path()]);

        fs::create_dir(r0.path().join("a")).unwrap();
        fs::set_permissions(r0.path().join("a"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::create_dir(r0.path().join("a/b")).unwrap();

        pool.ensure_ancestors(1, "/a/b/c.txt").unwrap();

        let a = fs::metadata(r1.path().join("a")).unwrap();
        assert!(a.is_dir());
        assert_eq!(a.mode() & 0o7777, 0o750);
        assert!(r1.path().join("a/b").is_dir());
        // The leaf itself is never created.
        assert!(!r1.path().join("a/b/c.txt").exists());
    }

    #[test]
    fn missing_ancestor_creates_nothing() {
        let r0 = tempfile::tempdir().unwrap();
        let r1 = tempfile::tempdir().unwrap();
        let pool = pool(&[r0.path(), r1.path()]);

        // /a exists on root 0, /a/b exists nowhere.
        fs::create_dir(r0.path().join("a")).unwrap();

        let err = pool.ensure_ancestors(1, "/a/b/c.txt").unwrap_err();
        assert!(matches!(err, Error::AncestorMissing));
        assert!(!r1.path().join("a").exists());
    }

    #[test]
    fn rerun_is_a_noop() {
        let r0 = tempfile::tempdir().unwrap();
        let r1 = tempfile::tempdir().unwrap();
        let pool = pool(&[r0.path(), r1.path()]);

        fs::create_dir_all(r0.path().join("x/y")).unwrap();
        pool.ensure_ancestors(1, "/x/y/f").unwrap();
        pool.ensure_ancestors(1, "/x/y/f").unwrap();
        assert!(r1.path().join("x/y").is_dir());
    }
}
