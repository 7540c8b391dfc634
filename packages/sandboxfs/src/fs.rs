//! Filesystem helpers: the advisory lock used to enforce a single daemon per
//! mount point (spec.md §4.3).

use std::{fmt::Debug, marker::PhantomData, path::Path};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use fslock::LockFile as FsLockFile;
use tracing::{instrument, trace};

use crate::{Locked, Unlocked};

/// An advisory exclusive lock on a file, typestated so that a locked handle
/// can't be locked again and an unlocked handle can't be unlocked.
///
/// The daemon holds one of these on its own log file throughout `RUNNING`
/// and `IDLE_ARMED`, releasing it only on entering `LINGER` so a successor
/// daemon can acquire the same lock (spec.md §4.3).
#[derive(Debug, Display)]
#[display("{}", path.display())]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: std::path::PathBuf,
    inner: FsLockFile,
}

impl LockFile<Unlocked> {
    /// Open (creating if necessary) the file at `path` without locking it.
    #[instrument]
    pub fn open(path: impl AsRef<Path> + Debug) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = FsLockFile::open(&path).context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            path,
            inner,
        })
    }

    /// Attempt to acquire the lock without blocking. Returns `Ok(None)` if
    /// another process already holds it (another daemon is running).
    #[instrument(skip_all, fields(%self))]
    pub fn try_lock(mut self) -> Result<Option<LockFile<Locked>>> {
        let acquired = self.inner.try_lock().context("try lock file")?;
        if !acquired {
            trace!(path = ?self.path, "lock held by another process");
            return Ok(None);
        }
        trace!(path = ?self.path, "locked file");
        Ok(Some(LockFile {
            state: PhantomData,
            path: self.path,
            inner: self.inner,
        }))
    }
}

impl LockFile<Locked> {
    /// Release the lock, returning the handle in its unlocked state.
    #[instrument(skip_all, fields(%self))]
    pub fn unlock(mut self) -> Result<LockFile<Unlocked>> {
        self.inner.unlock().context("unlock file")?;
        trace!(path = ?self.path, "unlocked file");
        Ok(LockFile {
            state: PhantomData,
            path: self.path,
            inner: self.inner,
        })
    }

    /// The path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("daemon.log");

        let unlocked = LockFile::open(&path).expect("open");
        let locked = unlocked.try_lock().expect("try_lock").expect("acquired");
        assert_eq!(locked.path(), path);
        let _unlocked_again = locked.unlock().expect("unlock");
    }

    #[test]
    fn second_lock_attempt_fails_while_first_holds_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("daemon.log");

        let first = LockFile::open(&path)
            .expect("open")
            .try_lock()
            .expect("try_lock")
            .expect("acquired");

        let second = LockFile::open(&path).expect("open");
        let result = second.try_lock().expect("try_lock does not error");
        assert!(result.is_none(), "second daemon must not acquire the lock");

        drop(first);
    }
}
