//! A scoped, process-advisory exclusive lock on a directory.
//!
//! Grounded on `utils/lock_file.rs`'s `LockFile` (same `fslock` crate, same
//! acquire-on-construct/release-on-drop shape), generalized to lock an arbitrary *directory*
//! (via a `.lock` sentinel file inside it) rather than a single named file.

use std::path::{Path, PathBuf};

/// Error returned when a directory cannot be locked.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The directory (or its parent) could not be created.
    #[error("failed to prepare directory for locking: {0}")]
    FailedToPrepareDirectory(String, #[source] std::io::Error),

    /// The underlying lock file could not be opened or locked.
    #[error("failed to acquire lock at {0}")]
    FailedToAcquire(String, #[source] std::io::Error),
}

/// Holds an exclusive, advisory lock on `directory` for as long as it is alive.
///
/// Blocks in [`Locked::acquire`] until the lock can be taken. Releases unconditionally on drop,
/// including when the caller's critical section panics or returns early via `?`.
pub struct Locked {
    sentinel_path: PathBuf,
    file: fslock::LockFile,
}

impl Locked {
    /// Acquires an exclusive lock on `directory`, blocking until available.
    ///
    /// Creates `directory` if it doesn't exist yet, then locks a `.lock` sentinel file inside it.
    pub fn acquire(directory: impl AsRef<Path>) -> Result<Self, LockError> {
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory).map_err(|e| {
            LockError::FailedToPrepareDirectory(directory.display().to_string(), e)
        })?;

        let sentinel_path = directory.join(".lock");
        tracing::debug!(path = %sentinel_path.display(), "acquiring lock");

        let mut file = fslock::LockFile::open(&sentinel_path)
            .map_err(|e| LockError::FailedToAcquire(sentinel_path.display().to_string(), e))?;
        file.lock()
            .map_err(|e| LockError::FailedToAcquire(sentinel_path.display().to_string(), e))?;

        Ok(Self {
            sentinel_path,
            file,
        })
    }
}

impl Drop for Locked {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        tracing::debug!(path = %self.sentinel_path.display(), "released lock");
    }
}
