// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The per-database write lock.
//!
//! One writer per database directory, enforced with an OS advisory lock on
//! a file inside the directory. The kernel drops advisory locks when the
//! owning descriptor is closed, so a crashed writer never wedges the
//! database.

use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Name of the lock file inside a database directory.
pub const LOCK_FILE: &str = "quartzlock";

/// Why a lock attempt failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LockFailure {
    InUse,
    Unsupported,
    FdLimit,
    Unknown,
}

// ENFILE/EMFILE; std has no stable ErrorKind for descriptor exhaustion.
#[cfg(unix)]
const FD_LIMIT_ERRNOS: [i32; 2] = [23, 24];
#[cfg(not(unix))]
const FD_LIMIT_ERRNOS: [i32; 0] = [];

fn classify(error: &std::io::Error) -> LockFailure {
    match error.kind() {
        ErrorKind::WouldBlock => LockFailure::InUse,
        ErrorKind::Unsupported => LockFailure::Unsupported,
        _ if error
            .raw_os_error()
            .is_some_and(|code| FD_LIMIT_ERRNOS.contains(&code)) =>
        {
            LockFailure::FdLimit
        }
        _ => LockFailure::Unknown,
    }
}

/// An exclusive advisory lock on a database directory.
///
/// Held for the lifetime of the value; dropping it (or crashing) releases
/// the lock.
#[derive(Debug)]
pub struct WriteLock {
    file: File,
    path: PathBuf,
}

impl WriteLock {
    /// Acquires the write lock for `dir`, without blocking.
    ///
    /// # Errors
    ///
    /// Returns a lock-contention error when another handle holds the lock,
    /// and distinguishable messages for filesystems without lock support
    /// and descriptor exhaustion.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Opening(format!("cannot open lock file {}: {e}", path.display())))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::trace!("acquired write lock at {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) => Err(match classify(&e) {
                LockFailure::InUse => Error::Locked(format!(
                    "database at {} is locked by another writer",
                    dir.display(),
                )),
                LockFailure::Unsupported => Error::Locked(format!(
                    "filesystem at {} does not support locking",
                    dir.display(),
                )),
                LockFailure::FdLimit => Error::Locked(format!(
                    "out of file descriptors trying to lock {}",
                    dir.display(),
                )),
                LockFailure::Unknown => Error::Locked(format!(
                    "cannot lock database at {}: {e}",
                    dir.display(),
                )),
            }),
        }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("failed to release write lock at {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn lock_is_exclusive() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let held = WriteLock::acquire(dir.path())?;

        // A second handle contends even within one process: advisory locks
        // attach to the open file description, not the process.
        match WriteLock::acquire(dir.path()) {
            Err(Error::Locked(_)) => {}
            other => panic!("expected lock contention, got {other:?}"),
        }

        drop(held);

        // After release, acquiring succeeds without any reset.
        let reacquired = WriteLock::acquire(dir.path())?;
        drop(reacquired);

        Ok(())
    }
}
