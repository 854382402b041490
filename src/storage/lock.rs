//! Advisory per-document locks.
//!
//! Each document gets its own `locks/<name>.lock` file. On unix the lock is a
//! `flock(2)` exclusive lock, which conflicts across processes and across
//! separately opened descriptors within one process, and is released by the
//! kernel if the holder dies. Elsewhere a `create_new` marker file stands in.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::Result;

/// Interval between non-blocking lock attempts while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A held document lock. Released on drop.
#[derive(Debug)]
pub struct DocumentLock {
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    path: PathBuf,
}

/// Lock file path for a document name such as `knowledge/fix_history.json`.
pub fn lock_path(root: &Path, document: &str) -> PathBuf {
    let flat = document.replace(['/', '\\'], "_");
    root.join("locks").join(format!("{}.lock", flat))
}

/// Try to take the lock for up to `timeout`.
///
/// Returns `Ok(None)` when the wait elapsed without acquiring the lock.
#[cfg(unix)]
pub fn acquire(path: &Path, timeout: Duration) -> Result<Option<DocumentLock>> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => return Ok(Some(DocumentLock { _guard: guard })),
            Err((returned, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                file = returned;
                thread::sleep(POLL_INTERVAL);
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        }
    }
}

#[cfg(not(unix))]
pub fn acquire(path: &Path, timeout: Duration) -> Result<Option<DocumentLock>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let deadline = Instant::now() + timeout;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => {
                return Ok(Some(DocumentLock {
                    path: path.to_path_buf(),
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(not(unix))]
impl Drop for DocumentLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
