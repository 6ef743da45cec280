use std::io;
use std::path::PathBuf;

/// Failures surfaced by the pool core.
///
/// Every variant maps to a POSIX errno so the FUSE adapter can hand the
/// result straight back to the kernel. No failure here is fatal to the
/// process; the triggering request fails and the mount stays usable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Path absent from every backing root.
    #[error("path not present on any backing root")]
    NotFound,

    /// Placement found no root with enough free space.
    #[error("no backing root has enough free space")]
    NoSpace,

    /// An ancestor directory of the target path exists on no root at all.
    #[error("ancestor directory not present on any backing root")]
    AncestorMissing,

    /// A native I/O call failed.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// A sibling handle could not be repointed during relocation. Non-fatal:
    /// logged, the relocation still commits.
    #[error("handle {handle_id} kept a stale descriptor for {}", .virtual_path.display())]
    PartialRelocation { handle_id: u64, virtual_path: PathBuf },
}

impl Error {
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::NoSpace => libc::ENOSPC,
            Error::AncestorMissing => libc::EFAULT,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::PartialRelocation { .. } => libc::EIO,
        }
    }
}

impl From<Error> for rfuse3::Errno {
    fn from(e: Error) -> Self {
        e.errno().into()
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
