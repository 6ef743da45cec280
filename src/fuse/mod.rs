//! FUSE protocol adapter.
//!
//! Translates rfuse3 callbacks into pool-core calls: path resolution for
//! attribute queries, placement + ancestor mirroring for creation, the handle
//! registry for file I/O, and the relocation engine when a write runs the
//! backing root out of space. Directory listings are a read-only union merge
//! over every root holding the directory; capacity reporting aggregates
//! statvfs over all roots.

pub mod inode;

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Result as FuseResult, SetAttr, Timestamp};

use crate::config::PoolConfig;
use crate::error::Error;
use crate::fuse::inode::{InodeTable, ROOT_INODE};
use crate::pool::Pool;
use crate::registry::HandleRegistry;
use crate::relocate::relocate;
use crate::util;

const TTL: Duration = Duration::from_secs(1);

pub struct PoolFs {
    pool: Pool,
    registry: HandleRegistry,
    inodes: InodeTable,
}

impl PoolFs {
    pub fn new(config: Arc<PoolConfig>) -> Self {
        Self::with_pool(Pool::new(config))
    }

    pub(crate) fn with_pool(pool: Pool) -> Self {
        Self {
            pool,
            registry: HandleRegistry::new(),
            inodes: InodeTable::new(),
        }
    }

    fn vpath(&self, ino: u64) -> FuseResult<PathBuf> {
        self.inodes.path_of(ino).ok_or_else(enoent)
    }

    fn resolved(&self, vpath: &Path) -> FuseResult<(usize, PathBuf)> {
        self.pool.resolve(vpath).ok_or_else(enoent)
    }

    fn attr_of(&self, vpath: &Path) -> FuseResult<FileAttr> {
        let (_, physical) = self.resolved(vpath)?;
        let meta = fs::symlink_metadata(&physical).map_err(io_errno)?;
        Ok(attr_from_metadata(self.inodes.ino_of(vpath), &meta))
    }

    /// Union directory listing: every root holding `vpath` as a directory
    /// contributes entries; the first occurrence of a name wins. Names stay
    /// raw `OsString`s end to end.
    fn union_entries(&self, vpath: &Path) -> FuseResult<Vec<(OsString, fs::Metadata)>> {
        let mut found_dir = false;
        let mut seen: HashSet<OsString> = HashSet::new();
        let mut entries = Vec::new();

        for root in self.pool.config().roots() {
            let dir = Pool::join(root, vpath);
            match fs::metadata(&dir) {
                Ok(meta) if meta.is_dir() => found_dir = true,
                _ => continue,
            }
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("readdir {}: {e}", dir.display());
                    continue;
                }
            };
            for entry in listing.flatten() {
                let name = entry.file_name();
                if !seen.insert(name.clone()) {
                    continue;
                }
                if let Ok(meta) = fs::symlink_metadata(entry.path()) {
                    entries.push((name, meta));
                }
            }
        }

        if !found_dir {
            if self.pool.resolve(vpath).is_some() {
                return Err(libc::ENOTDIR.into());
            }
            return Err(libc::ENOENT.into());
        }
        Ok(entries)
    }

    fn parent_ino(&self, vpath: &Path) -> u64 {
        match vpath.parent() {
            None => ROOT_INODE,
            Some(parent) => self.inodes.ino_of(parent),
        }
    }
}

impl Filesystem for PoolFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let parent_path = self.vpath(parent)?;
        let child = parent_path.join(name);
        let attr = self.attr_of(&child)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let vpath = self.vpath(inode)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(&vpath)?,
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let vpath = self.vpath(inode)?;
        let (_, physical) = self.resolved(&vpath)?;

        if let Some(size) = set_attr.size {
            match fh {
                Some(fh) if self.registry.lookup(fh).is_some() => {
                    self.registry.set_len(fh, size)?;
                }
                _ => {
                    nix::unistd::truncate(&physical, size as i64)
                        .map_err(|e| Errno::from(e as i32))?;
                }
            }
        }
        if let Some(mode) = set_attr.mode {
            fs::set_permissions(
                &physical,
                std::os::unix::fs::PermissionsExt::from_mode(mode),
            )
            .map_err(io_errno)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            nix::unistd::chown(
                &physical,
                set_attr.uid.map(nix::unistd::Uid::from_raw),
                set_attr.gid.map(nix::unistd::Gid::from_raw),
            )
            .map_err(|e| Errno::from(e as i32))?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            util::set_file_times(
                &physical,
                set_attr.atime.map(|t| (t.sec, t.nsec)),
                set_attr.mtime.map(|t| (t.sec, t.nsec)),
            )
            .map_err(io_errno)?;
        }

        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(&vpath)?,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let parent_path = self.vpath(parent)?;
        let (_, parent_physical) = self.resolved(&parent_path)?;
        let child = parent_path.join(name);
        let mode = nix::sys::stat::Mode::from_bits_truncate(mode & !umask);

        let physical = parent_physical.join(name);
        match nix::unistd::mkdir(&physical, mode) {
            Ok(()) => {}
            Err(nix::Error::ENOSPC) => {
                // The parent's root is full; place the directory elsewhere
                // and mirror the ancestors there.
                let root = self.pool.choose_root(0).ok_or(Error::NoSpace)?;
                self.pool.ensure_ancestors(root, &child)?;
                let physical = Pool::join(self.pool.config().root(root), &child);
                nix::unistd::mkdir(&physical, mode).map_err(|e| Errno::from(e as i32))?;
            }
            Err(e) => return Err(Errno::from(e as i32)),
        }

        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_of(&child)?,
            generation: 0,
        })
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent_path = self.vpath(parent)?;
        let child = parent_path.join(name);

        // A directory may exist on several roots; it is only gone from the
        // namespace when every physical copy is removed.
        let mut removed = false;
        while let Some((_, physical)) = self.pool.resolve(&child) {
            fs::remove_dir(&physical).map_err(io_errno)?;
            removed = true;
        }
        if !removed {
            return Err(libc::ENOENT.into());
        }
        self.inodes.forget_path(&child);
        Ok(())
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent_path = self.vpath(parent)?;
        let child = parent_path.join(name);
        let (_, physical) = self.resolved(&child)?;
        fs::remove_file(&physical).map_err(io_errno)?;
        self.inodes.forget_path(&child);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.vpath(parent)?.join(name);
        let new_parent_path = self.vpath(new_parent)?;
        let new = new_parent_path.join(new_name);

        let (from_root, from_physical) = self.resolved(&old)?;
        // The target's parent must be visible somewhere in the namespace;
        // its chain is then mirrored onto the source's root so the rename
        // never crosses devices.
        self.resolved(&new_parent_path)?;
        self.pool.ensure_ancestors(from_root, &new)?;
        let to_physical = Pool::join(self.pool.config().root(from_root), &new);
        fs::rename(&from_physical, &to_physical).map_err(io_errno)?;
        self.inodes.rename(&old, &new);
        Ok(())
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let vpath = self.vpath(inode)?;
        // A relocation holds this path exclusively between copy and commit;
        // an open landing in that window would miss the repointing pass and
        // end up on the doomed copy.
        let lock = self.registry.path_lock(&vpath);
        let _shared = lock.read().unwrap();

        let (_, physical) = self.resolved(&vpath)?;
        let file = util::open_with_flags(&physical, flags as i32, None).map_err(io_errno)?;
        let fh = self.registry.open(&vpath, physical, flags, file);
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let parent_path = self.vpath(parent)?;
        let child = parent_path.join(name);
        let lock = self.registry.path_lock(&child);
        let _shared = lock.read().unwrap();

        let physical = match self.pool.resolve(&child) {
            Some((_, physical)) => physical,
            None => {
                let root = self.pool.choose_root(0).ok_or(Error::NoSpace)?;
                self.pool.ensure_ancestors(root, &child)?;
                Pool::join(self.pool.config().root(root), &child)
            }
        };

        let open_flags = flags as i32 | libc::O_CREAT;
        let file =
            util::open_with_flags(&physical, open_flags, Some(mode)).map_err(io_errno)?;
        let fh = self
            .registry
            .open(&child, physical, open_flags as u32, file);

        Ok(ReplyCreated {
            ttl: TTL,
            attr: self.attr_of(&child)?,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let mut buf = vec![0u8; size as usize];
        let n = self.registry.read_at(fh, &mut buf, offset)?;
        buf.truncate(n);
        Ok(ReplyData {
            data: Bytes::from(buf),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        match self.registry.write_at(fh, data, offset) {
            Ok(n) => Ok(ReplyWrite { written: n as u32 }),
            Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ENOSPC) => {
                // The backing root is full: move the file to one that fits
                // the final size, then retry the write once.
                relocate(
                    &self.pool,
                    &self.registry,
                    fh,
                    offset + data.len() as u64,
                )?;
                let n = self.registry.write_at(fh, data, offset)?;
                Ok(ReplyWrite { written: n as u32 })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        match self.registry.close(fh) {
            Some(_) => Ok(()),
            None => Err(libc::EBADF.into()),
        }
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, datasync: bool) -> FuseResult<()> {
        self.registry.fsync(fh, datasync)?;
        Ok(())
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let vpath = self.vpath(inode)?;
        let (_, physical) = self.resolved(&vpath)?;
        let meta = fs::metadata(&physical).map_err(io_errno)?;
        if !meta.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        inode: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let vpath = self.vpath(inode)?;
        let merged = self.union_entries(&vpath)?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(merged.len() + 2);
        all.push(DirectoryEntry {
            inode,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: self.parent_ino(&vpath),
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, (name, meta)) in merged.iter().enumerate() {
            let child = vpath.join(name);
            all.push(DirectoryEntry {
                inode: self.inodes.ino_of(&child),
                kind: kind_of(meta),
                name: name.clone(),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let vpath = self.vpath(parent)?;
        let merged = self.union_entries(&vpath)?;

        let self_attr = self.attr_of(&vpath)?;
        let parent_path = self.inodes.path_of(self.parent_ino(&vpath));
        let parent_attr = match parent_path {
            Some(p) => self.attr_of(&p).unwrap_or(self_attr),
            None => self_attr,
        };

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(merged.len() + 2);
        all.push(DirectoryEntryPlus {
            inode: parent,
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: self_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        all.push(DirectoryEntryPlus {
            inode: self.parent_ino(&vpath),
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: parent_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        for (i, (name, meta)) in merged.iter().enumerate() {
            let child = vpath.join(name);
            let ino = self.inodes.ino_of(&child);
            all.push(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind: kind_of(meta),
                name: name.clone(),
                offset: (i as i64) + 3,
                attr: attr_from_metadata(ino, meta),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> FuseResult<ReplyStatFs> {
        let mut stats = Vec::with_capacity(self.pool.config().roots().len());
        for root in self.pool.config().roots() {
            let st = nix::sys::statvfs::statvfs(root.as_path())
                .map_err(|e| Errno::from(e as i32))?;
            stats.push(st);
        }

        // Roots may sit on filesystems with different block sizes; scale
        // every count to the smallest sizes before summing.
        let mut min_bsize = stats.iter().map(|s| s.block_size()).min().unwrap_or(512);
        let mut min_frsize = stats.iter().map(|s| s.fragment_size()).min().unwrap_or(512);
        if min_bsize == 0 {
            min_bsize = 512;
        }
        if min_frsize == 0 {
            min_frsize = 512;
        }

        let mut reply = ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: min_bsize as u32,
            namelen: 0,
            frsize: min_frsize as u32,
        };
        for st in &stats {
            let bscale = (st.block_size() / min_bsize).max(1) as u64;
            let fscale = (st.fragment_size() / min_frsize).max(1) as u64;
            reply.blocks += st.blocks() as u64 * fscale;
            reply.bfree += st.blocks_free() as u64 * bscale;
            reply.bavail += st.blocks_available() as u64 * bscale;
            reply.files += st.files() as u64;
            reply.ffree += st.files_free() as u64;
            reply.namelen = reply.namelen.max(st.name_max() as u32);
        }
        Ok(reply)
    }

    async fn access(&self, _req: Request, inode: u64, mask: u32) -> FuseResult<()> {
        let vpath = self.vpath(inode)?;
        let (_, physical) = self.resolved(&vpath)?;
        nix::unistd::access(
            &physical,
            nix::unistd::AccessFlags::from_bits_truncate(mask as i32),
        )
        .map_err(|e| Errno::from(e as i32))
    }

    async fn readlink(&self, _req: Request, inode: u64) -> FuseResult<ReplyData> {
        let vpath = self.vpath(inode)?;
        let (_, physical) = self.resolved(&vpath)?;
        let target = fs::read_link(&physical).map_err(io_errno)?;
        Ok(ReplyData {
            data: Bytes::copy_from_slice(target.as_os_str().as_bytes()),
        })
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn enoent() -> Errno {
    libc::ENOENT.into()
}

fn io_errno(e: std::io::Error) -> Errno {
    e.raw_os_error().unwrap_or(libc::EIO).into()
}

fn kind_of(meta: &fs::Metadata) -> FileType {
    match meta.mode() & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn attr_from_metadata(ino: u64, meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: Timestamp::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        kind: kind_of(meta),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: meta.blksize() as u32,
    }
}
