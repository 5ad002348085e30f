//! Advisory exclusive file locking for coordinating with cooperating
//! processes (not threads) on a shared file — the Port Registry's only
//! concurrency primitive.

use nix::fcntl::{Flock, FlockArg};
use std::io;
use std::path::{Path, PathBuf};

/// Holds an exclusive `flock(2)` on a file for the lifetime of the guard.
/// Dropping it releases the lock.
pub struct FileLock {
    // Only ever `None` after `into_inner` strips it for the async drop path;
    // otherwise always `Some`.
    inner: Option<Flock<std::fs::File>>,
}

impl FileLock {
    /// Acquire a blocking exclusive lock on `path`, creating the file
    /// (mode 0644) if it does not exist. Blocks the calling thread, so this
    /// is always run via [`tokio::task::spawn_blocking`] by callers that
    /// hold an async context.
    pub fn acquire_blocking(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o644)
            .open(path)?;

        let locked = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, errno)| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("flock {} failed: {errno}", path.display()),
            )
        })?;

        Ok(Self {
            inner: Some(locked),
        })
    }

    /// Acquire the lock from an async context without blocking the
    /// executor's worker thread.
    pub async fn acquire(path: PathBuf) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("lock task panicked: {e}")))?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Flock::unlock consumes self; dropping the inner File also
        // releases the flock at the OS level, so plain drop suffices.
        self.inner.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_missing_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.lck");
        let guard = FileLock::acquire(path.clone()).await.unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[tokio::test]
    async fn held_lock_blocks_a_nonblocking_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.lck");

        let _guard = FileLock::acquire(path.clone()).await.unwrap();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let err = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap_err();
        assert_eq!(err.1, nix::errno::Errno::EWOULDBLOCK);
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.lck");

        let guard = FileLock::acquire(path.clone()).await.unwrap();
        drop(guard);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        // Should not block / error now that the first guard was dropped.
        let _lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).unwrap();
    }
}
