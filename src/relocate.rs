//! Transparent file relocation.
//!
//! When a write overflows the root currently backing a file, the file's full
//! contents and metadata are copied to another root, every open descriptor on
//! that virtual path is repointed to the new copy, and the stale copy is
//! deleted. Callers keep their handle ids and seek positions throughout. This
//! is the only code that changes a live handle's physical location, and it
//! does so under the per-path exclusive lock.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{Gid, Uid};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::registry::{Handle, HandleRegistry};
use crate::util;

/// Copy-loop buffer size.
const MOVE_BLOCK_SIZE: usize = 32 * 1024;

/// Outcome of a relocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// The current root turned out to have room after all; nothing moved.
    Skipped,
    /// The file now lives on another root and all handles were repointed.
    Moved,
}

/// Moves the file behind `handle_id` to a root that can hold `trigger_size`
/// bytes (`max(current_size, write_offset + write_length)` at the caller).
///
/// On success the caller retries its failed write once against the repointed
/// descriptor. On failure the old copy remains authoritative and untouched.
pub fn relocate(
    pool: &Pool,
    registry: &HandleRegistry,
    handle_id: u64,
    trigger_size: u64,
) -> Result<Relocation> {
    let handle = registry
        .lookup(handle_id)
        .ok_or_else(|| Error::Io(std::io::Error::from_raw_os_error(libc::EBADF)))?;
    let virtual_path = handle.virtual_path().to_path_buf();

    let (source, current_root) = {
        let state = handle.state();
        let root = pool
            .resolve_root(&virtual_path)
            .ok_or(Error::NotFound)?;
        (state.physical_path.clone(), root)
    };

    let st = fs::metadata(&source)?;
    let final_size = st.len().max(trigger_size);

    // The overflow may have been a transient race with another writer; if the
    // current root can hold the final size now, skip the move entirely.
    if let Ok(avail) = pool.probe().available(pool.config().root(current_root))
        && avail >= final_size
    {
        debug!(
            "relocate {}: current root {current_root} recovered, skipping",
            virtual_path.display()
        );
        return Ok(Relocation::Skipped);
    }

    // Everything from here to commit/rollback runs with the path held
    // exclusively: sibling reads and writes block until the swap is done.
    let path_lock = registry.path_lock(&virtual_path);
    let _exclusive = path_lock.write().unwrap();

    let target_root = pool.choose_root(final_size).ok_or(Error::NoSpace)?;
    pool.ensure_ancestors(target_root, &virtual_path)?;
    let target = Pool::join(pool.config().root(target_root), &virtual_path);

    info!(
        "relocate {}: {} -> {} ({final_size} bytes)",
        virtual_path.display(),
        source.display(),
        target.display()
    );

    if let Err(e) = copy_contents(&source, &target) {
        rollback(&target);
        return Err(e);
    }
    if let Err(e) = copy_metadata(&target, &st) {
        rollback(&target);
        return Err(e);
    }

    let siblings = registry.lookup_all_by_virtual_path(&virtual_path);
    for (position, sibling) in siblings.iter().enumerate() {
        match repoint(sibling, &target) {
            Ok(()) => {}
            Err(e) if position == 0 => {
                // The triggering handle must land on the new copy or the
                // whole operation is void.
                rollback(&target);
                return Err(e);
            }
            Err(e) => {
                // Best effort for the rest: the stale descriptor stays valid
                // until the old copy is unlinked below.
                let partial = Error::PartialRelocation {
                    handle_id: sibling.id(),
                    virtual_path: virtual_path.clone(),
                };
                warn!("{partial}: {e}");
            }
        }
    }

    if let Err(e) = fs::remove_file(&source) {
        warn!(
            "relocate {}: can not unlink stale copy {}: {e}",
            virtual_path.display(),
            source.display()
        );
    }
    Ok(Relocation::Moved)
}

fn copy_contents(source: &Path, target: &Path) -> Result<()> {
    let mut input = File::open(source)?;
    let mut output = File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)?;

    let mut buf = vec![0u8; MOVE_BLOCK_SIZE];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
    }
    output.flush()?;
    Ok(())
}

/// Clones mode, owner, group and atime/mtime from the source's pre-copy stat.
fn copy_metadata(target: &Path, st: &fs::Metadata) -> Result<()> {
    fs::set_permissions(target, fs::Permissions::from_mode(st.mode()))?;
    nix::unistd::chown(
        target,
        Some(Uid::from_raw(st.uid())),
        Some(Gid::from_raw(st.gid())),
    )?;
    util::set_file_times(
        target,
        Some((st.atime(), st.atime_nsec() as u32)),
        Some((st.mtime(), st.mtime_nsec() as u32)),
    )?;
    Ok(())
}

/// Swaps one handle's descriptor onto the new copy, preserving its seek
/// position and id. Opens with the original flags minus `O_EXCL`/`O_TRUNC`.
fn repoint(handle: &Arc<Handle>, target: &Path) -> Result<()> {
    let mut state = handle.state();
    let offset = util::tell(state.file.as_raw_fd())?;
    let flags = util::reopen_flags(handle.flags());
    let file = util::open_with_flags(target, flags as i32, None)?;
    util::seek_to(file.as_raw_fd(), offset)?;
    debug!(
        "repoint id={} -> {} at offset {offset}",
        handle.id(),
        target.display()
    );
    state.physical_path = target.to_path_buf();
    state.file = file;
    Ok(())
}

fn rollback(target: &Path) {
    if let Err(e) = fs::remove_file(target)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("relocate rollback: can not remove {}: {e}", target.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_MOVE_LIMIT;
    use crate::pool::tests_support::{FakeProbe, scripted_pool};
    use std::io::{Seek, SeekFrom};

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        _r0: tempfile::TempDir,
        _r1: tempfile::TempDir,
        pool: Pool,
        probe: Arc<FakeProbe>,
        registry: HandleRegistry,
        root0: PathBuf,
        root1: PathBuf,
    }

    /// Two roots with scripted capacities, headroom at the 100 MiB floor.
    fn fixture(avail0: u64, avail1: u64) -> Fixture {
        let r0 = tempfile::tempdir().unwrap();
        let r1 = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new(&[
            (r0.path(), avail0),
            (r1.path(), avail1),
        ]));
        let pool = scripted_pool(&[r0.path(), r1.path()], MIN_MOVE_LIMIT, probe.clone());
        let root0 = r0.path().to_path_buf();
        let root1 = r1.path().to_path_buf();
        Fixture {
            _r0: r0,
            _r1: r1,
            pool,
            probe,
            registry: HandleRegistry::new(),
            root0,
            root1,
        }
    }

    fn seed_file(root: &Path, vpath: &str, content: &[u8]) -> PathBuf {
        let physical = Pool::join(root, vpath);
        fs::write(&physical, content).unwrap();
        physical
    }

    fn open_handle(fx: &Fixture, vpath: &str) -> u64 {
        open_handle_with_flags(fx, vpath, libc::O_RDWR)
    }

    /// Registers a handle whose recorded flags differ from how the descriptor
    /// was actually opened. `O_DIRECTORY` on a regular file makes every later
    /// reopen of that handle fail with ENOTDIR.
    fn open_handle_with_flags(fx: &Fixture, vpath: &str, flags: i32) -> u64 {
        let (_, physical) = fx.pool.resolve(vpath).unwrap();
        let file = util::open_with_flags(&physical, libc::O_RDWR, None).unwrap();
        fx.registry.open(vpath, physical, flags as u32, file)
    }

    #[test]
    fn moves_file_and_repoints_resolution() {
        let fx = fixture(1_000, MIN_MOVE_LIMIT + 64 * MIB);
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let old_physical = seed_file(&fx.root0, "/big.bin", &content);
        let id = open_handle(&fx, "/big.bin");

        let outcome =
            relocate(&fx.pool, &fx.registry, id, content.len() as u64 + MIB).unwrap();
        assert_eq!(outcome, Relocation::Moved);

        // Resolution moved to root 1 and the stale copy is gone.
        assert_eq!(fx.pool.resolve_root("/big.bin"), Some(1));
        assert!(!old_physical.exists());

        // Byte-for-byte identical content at the new location.
        let moved = fs::read(Pool::join(&fx.root1, "/big.bin")).unwrap();
        assert_eq!(moved, content);

        // The caller's pending write now succeeds on the repointed handle.
        assert_eq!(fx.registry.write_at(id, b"tail", content.len() as u64).unwrap(), 4);
    }

    #[test]
    fn preserves_metadata_and_timestamps() {
        let fx = fixture(1_000, MIN_MOVE_LIMIT + 64 * MIB);
        let physical = seed_file(&fx.root0, "/meta.bin", b"payload");
        fs::set_permissions(&physical, fs::Permissions::from_mode(0o640)).unwrap();
        util::set_file_times(&physical, Some((11_111, 0)), Some((22_222, 0))).unwrap();
        let id = open_handle(&fx, "/meta.bin");

        relocate(&fx.pool, &fx.registry, id, 1 * MIB).unwrap();

        let st = fs::metadata(Pool::join(&fx.root1, "/meta.bin")).unwrap();
        assert_eq!(st.mode() & 0o7777, 0o640);
        assert_eq!(st.atime(), 11_111);
        assert_eq!(st.mtime(), 22_222);
    }

    #[test]
    fn sibling_handles_keep_their_offsets() {
        let fx = fixture(1_000, MIN_MOVE_LIMIT + 64 * MIB);
        let content: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
        seed_file(&fx.root0, "/video.mp4", &content);

        let a = open_handle(&fx, "/video.mp4");
        let b = open_handle(&fx, "/video.mp4");
        let writer = open_handle(&fx, "/video.mp4");

        // Park the two readers at different cursor positions.
        let ha = fx.registry.lookup(a).unwrap();
        ha.state().file.seek(SeekFrom::Start(0)).unwrap();
        let hb = fx.registry.lookup(b).unwrap();
        hb.state().file.seek(SeekFrom::Start(50_000)).unwrap();

        relocate(&fx.pool, &fx.registry, writer, content.len() as u64 + MIB).unwrap();

        // Both sibling descriptors continue from their captured offsets on
        // the new copy.
        let mut buf = vec![0u8; 1_000];
        {
            let mut state = ha.state();
            state.file.read_exact(&mut buf).unwrap();
            assert_eq!(buf, content[0..1_000]);
            assert_eq!(state.physical_path, Pool::join(&fx.root1, "/video.mp4"));
        }
        {
            let mut state = hb.state();
            state.file.read_exact(&mut buf).unwrap();
            assert_eq!(buf, content[50_000..51_000]);
        }
    }

    #[test]
    fn reopen_failure_on_the_first_handle_rolls_back() {
        let fx = fixture(1_000, MIN_MOVE_LIMIT + 64 * MIB);
        seed_file(&fx.root0, "/locked.bin", b"payload");
        let id = open_handle_with_flags(&fx, "/locked.bin", libc::O_RDWR | libc::O_DIRECTORY);

        let err = relocate(&fx.pool, &fx.registry, id, 2 * MIB).unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        // Rolled back: no new copy, the old copy stays authoritative and the
        // handle still works against it.
        assert!(!Pool::join(&fx.root1, "/locked.bin").exists());
        assert_eq!(fx.pool.resolve_root("/locked.bin"), Some(0));
        assert_eq!(fx.registry.write_at(id, b"!", 0).unwrap(), 1);
    }

    #[test]
    fn reopen_failure_on_a_sibling_still_commits() {
        let fx = fixture(1_000, MIN_MOVE_LIMIT + 64 * MIB);
        seed_file(&fx.root0, "/shared.bin", b"0123456789");
        let first = open_handle(&fx, "/shared.bin");
        let stale = open_handle_with_flags(&fx, "/shared.bin", libc::O_RDWR | libc::O_DIRECTORY);

        let outcome = relocate(&fx.pool, &fx.registry, first, 2 * MIB).unwrap();
        assert_eq!(outcome, Relocation::Moved);
        assert_eq!(fx.pool.resolve_root("/shared.bin"), Some(1));

        // The triggering handle landed on the new copy.
        let target = Pool::join(&fx.root1, "/shared.bin");
        assert_eq!(
            fx.registry.lookup(first).unwrap().state().physical_path,
            target
        );

        // The sibling keeps its stale descriptor: never switched roots, yet
        // still readable even though the old copy is unlinked.
        let stale_handle = fx.registry.lookup(stale).unwrap();
        assert_ne!(stale_handle.state().physical_path, target);
        let mut buf = [0u8; 10];
        assert_eq!(fx.registry.read_at(stale, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"0123456789");
    }

    #[test]
    fn no_space_anywhere_surfaces_and_creates_nothing() {
        let fx = fixture(1_000, 1_000);
        seed_file(&fx.root0, "/stuck.bin", b"data");
        let id = open_handle(&fx, "/stuck.bin");

        let err = relocate(&fx.pool, &fx.registry, id, 500 * MIB).unwrap_err();
        assert!(matches!(err, Error::NoSpace));

        // No target file was created, the original is untouched.
        assert!(!Pool::join(&fx.root1, "/stuck.bin").exists());
        assert_eq!(fs::read(Pool::join(&fx.root0, "/stuck.bin")).unwrap(), b"data");
    }

    #[test]
    fn transient_race_is_skipped() {
        let fx = fixture(MIN_MOVE_LIMIT + 512 * MIB, 1_000);
        seed_file(&fx.root0, "/racy.bin", b"data");
        let id = open_handle(&fx, "/racy.bin");

        // The current root reports plenty of space by the time we look.
        let outcome = relocate(&fx.pool, &fx.registry, id, 10 * MIB).unwrap();
        assert_eq!(outcome, Relocation::Skipped);
        assert_eq!(fx.pool.resolve_root("/racy.bin"), Some(0));

        // Once it really is full, the same call moves the file.
        fx.probe.set(&fx.root0, 1_000);
        fx.probe.set(&fx.root1, MIN_MOVE_LIMIT + 64 * MIB);
        let outcome = relocate(&fx.pool, &fx.registry, id, 10 * MIB).unwrap();
        assert_eq!(outcome, Relocation::Moved);
        assert_eq!(fx.pool.resolve_root("/racy.bin"), Some(1));
    }

    #[test]
    fn mirrors_ancestors_on_the_target_root() {
        let fx = fixture(1_000, MIN_MOVE_LIMIT + 64 * MIB);
        fs::create_dir_all(Pool::join(&fx.root0, "/a/b")).unwrap();
        seed_file(&fx.root0, "/a/b/deep.bin", b"deep");
        let id = open_handle(&fx, "/a/b/deep.bin");

        relocate(&fx.pool, &fx.registry, id, 2 * MIB).unwrap();

        assert!(Pool::join(&fx.root1, "/a/b").is_dir());
        assert_eq!(
            fs::read(Pool::join(&fx.root1, "/a/b/deep.bin")).unwrap(),
            b"deep"
        );
    }

    #[test]
    fn overflow_scenario_two_roots() {
        // 2 roots, ~10 MiB free each (headroom floored at 100 MiB, so the
        // fallback path is what places the file): a 10.5 MiB final size does
        // not fit root 0 but fits root 1.
        let fx = fixture(10 * MIB, 11 * MIB);
        let content = vec![0xabu8; 4 * MIB as usize];
        seed_file(&fx.root0, "/grow.bin", &content);
        let id = open_handle(&fx, "/grow.bin");

        let outcome = relocate(&fx.pool, &fx.registry, id, 10 * MIB + 512 * 1024).unwrap();
        assert_eq!(outcome, Relocation::Moved);
        assert_eq!(fx.pool.resolve_root("/grow.bin"), Some(1));
        assert!(!Pool::join(&fx.root0, "/grow.bin").exists());
        assert_eq!(
            fx.registry.write_at(id, b"pending", content.len() as u64).unwrap(),
            7
        );
    }
}
