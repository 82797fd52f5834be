//! Advisory LOCK file of a WAL directory (fs2).
//!
//! A writer holds it exclusively for its whole life; wal-dump takes it shared
//! so it never reads a file that is being created. Released on drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "LOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct WalDirLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl WalDirLock {
    /// Non-blocking: fails at once if a conflicting holder exists.
    pub fn acquire(dir: &Path, mode: LockMode) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        let res = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        res.with_context(|| format!("WAL dir {} is locked ({:?} wanted)", dir.display(), mode))?;
        log::debug!("locked {} ({:?})", path.display(), mode);
        Ok(Self { file, path, mode })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for WalDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_excludes_writers_and_readers() -> Result<()> {
        let root = std::env::temp_dir().join(format!("qv-lock-{}", std::process::id()));
        std::fs::create_dir_all(&root)?;

        let w = WalDirLock::acquire(&root, LockMode::Exclusive)?;
        assert_eq!(w.mode(), LockMode::Exclusive);
        assert!(w.path().ends_with(LOCK_FILE));
        assert!(WalDirLock::acquire(&root, LockMode::Exclusive).is_err());
        assert!(WalDirLock::acquire(&root, LockMode::Shared).is_err());
        drop(w);

        let r1 = WalDirLock::acquire(&root, LockMode::Shared)?;
        let _r2 = WalDirLock::acquire(&root, LockMode::Shared)?;
        assert!(WalDirLock::acquire(&root, LockMode::Exclusive).is_err());
        drop(r1);
        let _ = std::fs::remove_dir_all(&root);
        Ok(())
    }
}
