use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Identity-plus-freshness fingerprint of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    dev: u64,
    ino: u64,
    mtime: i64,
    mtime_nsec: i64,
}

impl Stamp {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })
    }
}

/// Stat-based memoized dirty-check gating the supervisor's redundant
/// filesystem reads.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    stamps: HashMap<PathBuf, Stamp>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports whether `path` changed since the last observation. The
    /// first observation is a change; stat failures propagate.
    pub fn changed(&mut self, path: &Path) -> io::Result<bool> {
        let stamp = Stamp::of(path)?;
        match self.stamps.insert(path.to_path_buf(), stamp) {
            None => Ok(true),
            Some(previous) => Ok(previous != stamp),
        }
    }

    /// Drops the cached stamp so the next observation reads as changed.
    pub fn forget(&mut self, path: &Path) {
        self.stamps.remove(path);
    }
}
