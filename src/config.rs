use std::io;
use std::path::{Path, PathBuf};

/// Default relocation headroom: a root must keep this much space past the
/// requested size to be picked without falling back to the largest root.
pub const DEFAULT_MOVE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Enforced floor for the headroom.
pub const MIN_MOVE_LIMIT: u64 = 100 * 1024 * 1024;

/// Immutable pool configuration, built once at mount time and shared by
/// reference with every component. Roots are ordered; a root's index in this
/// list is its stable identity for the life of the process.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    roots: Vec<PathBuf>,
    move_limit: u64,
}

impl PoolConfig {
    /// Validates that every root exists and is a directory, and clamps the
    /// headroom to its floor.
    pub fn new(roots: Vec<PathBuf>, move_limit: u64) -> io::Result<Self> {
        if roots.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "at least one backing root is required",
            ));
        }
        for root in &roots {
            let meta = std::fs::metadata(root).map_err(|e| {
                io::Error::new(e.kind(), format!("can not stat '{}': {e}", root.display()))
            })?;
            if !meta.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("'{}' is not a directory", root.display()),
                ));
            }
        }
        Ok(Self {
            roots,
            move_limit: move_limit.max(MIN_MOVE_LIMIT),
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn root(&self, index: usize) -> &Path {
        &self.roots[index]
    }

    pub fn move_limit(&self) -> u64 {
        self.move_limit
    }
}

/// Parses a byte count with an optional `k`/`m`/`g` suffix, e.g. `4G`,
/// `512m`, `102400`. Used for the `--mlimit` option.
pub fn parse_limit(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".into());
    }
    let (digits, mult) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 1024),
        b'm' | b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    n.checked_mul(mult)
        .ok_or_else(|| format!("size '{s}' overflows"))
}
