//! poolfs: a union file store that pools several directory roots behind one
//! FUSE mountpoint. Lookups search the roots in order, new files land on a
//! root chosen by free space, and a file whose root fills up mid-write is
//! moved to a roomier root without disturbing the handles open on it.

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod fuse;
pub mod pool;
pub mod registry;
pub mod relocate;
mod util;

use std::ffi::{OsStr, OsString};
use std::io;
use std::sync::Arc;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use fuse::PoolFs;

/// Mount the pool at `mountpoint`. With `unprivileged` the session goes
/// through fusermount3 instead of mount(2).
pub async fn mount_pool(
    config: Arc<PoolConfig>,
    mountpoint: &OsStr,
    unprivileged: bool,
) -> io::Result<MountHandle> {
    let fs = PoolFs::new(config);
    let mount_path = OsString::from(mountpoint);

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mount_options = MountOptions::default();
    mount_options
        .force_readdir_plus(true)
        .fs_name("poolfs")
        .uid(uid)
        .gid(gid);

    if unprivileged {
        Session::new(mount_options)
            .mount_with_unprivileged(fs, mount_path)
            .await
    } else {
        Session::new(mount_options).mount(fs, mount_path).await
    }
}
