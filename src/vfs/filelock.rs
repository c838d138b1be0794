//! # Advisory File Locks
//!
//! RAII wrappers over `flock(2)`. An array directory carries a lock file
//! (`__lock.tsr`); readers hold it shared for the lifetime of their open
//! entry, and the consolidation delete phase holds it exclusive. The lock
//! is advisory and process-cooperative, which is exactly the contract the
//! storage manager needs: cross-process mutual exclusion between open
//! readers and a consolidator deleting fragment directories.
//!
//! Locks can be disabled (`vfs.file.enable_filelocks = false`), in which
//! case handles are inert. The handle still keeps the file open so the
//! enable flag can differ between processes without changing lock-file
//! lifetime.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{Result, WrapErr};

use crate::error::StorageError;

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held advisory lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: Option<File>,
    mode: LockMode,
}

impl FileLock {
    /// Acquires a lock on `path`, blocking until granted. Creates the lock
    /// file if absent. When `enabled` is false the returned handle holds
    /// the file without locking it.
    pub fn acquire(path: &Path, mode: LockMode, enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                eyre::eyre!(StorageError::LockError(format!(
                    "cannot open lock file '{}': {e}",
                    path.display()
                )))
            })?;

        if enabled {
            flock_blocking(&file, mode)
                .wrap_err_with(|| format!("acquiring filelock '{}'", path.display()))?;
        }

        Ok(Self {
            file: Some(file),
            mode,
        })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        // Closing the descriptor releases the flock.
        self.file.take();
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn flock_blocking(file: &File, mode: LockMode) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        eyre::bail!(StorageError::LockError(format!("flock failed: {err}")));
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock_blocking(_file: &File, _mode: LockMode) -> Result<()> {
    Ok(())
}
