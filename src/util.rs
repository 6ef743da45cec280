//! Shared open-flag and timestamp helpers.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Opens `path` honoring raw `O_*` flags from the kernel. `mode` is applied
/// when the flags may create the file.
pub fn open_with_flags(path: &Path, flags: i32, mode: Option<u32>) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => opts.write(true),
        libc::O_RDWR => opts.read(true).write(true),
        _ => opts.read(true),
    };
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
    }
    if flags & libc::O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & libc::O_EXCL != 0 {
        opts.create_new(true);
    }
    if let Some(mode) = mode {
        opts.mode(mode);
    }
    opts.custom_flags(
        flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL),
    );
    opts.open(path)
}

/// Flag mask for reopening descriptors onto a relocated copy: the data
/// already there must be neither rejected (`O_EXCL`) nor erased (`O_TRUNC`).
pub fn reopen_flags(flags: u32) -> u32 {
    flags & !((libc::O_EXCL | libc::O_TRUNC) as u32)
}

/// Sets atime/mtime on `path` with nanosecond precision; `None` leaves the
/// corresponding timestamp untouched.
pub fn set_file_times(
    path: &Path,
    atime: Option<(i64, u32)>,
    mtime: Option<(i64, u32)>,
) -> io::Result<()> {
    fn spec(t: Option<(i64, u32)>) -> libc::timespec {
        match t {
            Some((sec, nsec)) => libc::timespec {
                tv_sec: sec,
                tv_nsec: nsec as libc::c_long,
            },
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
        }
    }

    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let times = [spec(atime), spec(mtime)];
    let ret = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Current seek position of a descriptor.
pub fn tell(fd: i32) -> io::Result<i64> {
    let off = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
    if off < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(off)
}

/// Seeks a descriptor to an absolute position.
pub fn seek_to(fd: i32, offset: i64) -> io::Result<()> {
    let off = unsafe { libc::lseek(fd, offset, libc::SEEK_SET) };
    if off != offset {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn reopen_mask_strips_excl_and_trunc() {
        let flags = (libc::O_RDWR | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND) as u32;
        let masked = reopen_flags(flags);
        assert_eq!(masked & libc::O_EXCL as u32, 0);
        assert_eq!(masked & libc::O_TRUNC as u32, 0);
        assert_ne!(masked & libc::O_APPEND as u32, 0);
    }

    #[test]
    fn open_with_flags_respects_accmode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"content").unwrap();

        let mut ro = open_with_flags(&path, libc::O_RDONLY, None).unwrap();
        let mut buf = String::new();
        ro.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "content");

        // Reopening without O_TRUNC must keep the existing bytes.
        let rw = open_with_flags(&path, libc::O_RDWR, None).unwrap();
        assert_eq!(rw.metadata().unwrap().len(), 7);

        let mut wo = open_with_flags(&path, libc::O_WRONLY, None).unwrap();
        wo.write_all(b"X").unwrap();
        assert!(wo.read_to_string(&mut buf).is_err());
    }

    #[test]
    fn tell_and_seek_track_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut f = File::options().read(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(tell(f.as_raw_fd()).unwrap(), 4);

        seek_to(f.as_raw_fd(), 7).unwrap();
        let mut rest = String::new();
        f.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "789");
    }

    #[test]
    fn set_file_times_applies_both() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        set_file_times(&path, Some((1_000_000, 0)), Some((2_000_000, 500))).unwrap();
        let st = std::fs::metadata(&path).unwrap();
        assert_eq!(st.atime(), 1_000_000);
        assert_eq!(st.mtime(), 2_000_000);
    }
}
