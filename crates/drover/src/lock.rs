//! Scoped shared and exclusive advisory locks on the handle's lock file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::TRACE_TARGET;
use crate::error::SupervisorError;

/// Advisory `flock` on a named path, held for the duration of a closure.
///
/// Each acquisition opens its own descriptor and `flock` locks belong to
/// the open file description, so threads within one process contend exactly
/// like separate processes do; no additional in-process serialization is
/// layered on top. Acquisition blocks until granted, which means nesting an
/// exclusive acquisition inside another acquisition of the same path on one
/// thread deadlocks — callers must not nest.
///
/// The descriptor is opened close-on-exec, so spawned daemons never inherit
/// the lock.
#[derive(Debug, Clone)]
pub(crate) struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `body` under a shared lock.
    pub(crate) fn with_shared<T>(
        &self,
        body: impl FnOnce() -> Result<T, SupervisorError>,
    ) -> Result<T, SupervisorError> {
        self.scoped(FlockArg::LockShared, "shared", body)
    }

    /// Runs `body` under an exclusive lock.
    pub(crate) fn with_exclusive<T>(
        &self,
        body: impl FnOnce() -> Result<T, SupervisorError>,
    ) -> Result<T, SupervisorError> {
        self.scoped(FlockArg::LockExclusive, "exclusive", body)
    }

    fn scoped<T>(
        &self,
        mode: FlockArg,
        mode_name: &'static str,
        body: impl FnOnce() -> Result<T, SupervisorError>,
    ) -> Result<T, SupervisorError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| SupervisorError::LockOpen {
                path: self.path.clone(),
                source,
            })?;
        let guard = Flock::lock(file, mode).map_err(|(_, errno)| SupervisorError::LockAcquire {
            path: self.path.clone(),
            source: errno,
        })?;
        trace!(target: TRACE_TARGET, path = %self.path.display(), mode = mode_name, "lock acquired");
        // The guard releases on drop, so the lock is let go on every exit
        // path, unwinding included.
        let result = body();
        drop(guard);
        trace!(target: TRACE_TARGET, path = %self.path.display(), mode = mode_name, "lock released");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    fn lock_in(dir: &TempDir) -> LockFile {
        LockFile::new(dir.path().join("daemon.pid.lock"))
    }

    #[test]
    fn creates_lock_file_on_first_use() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir);
        lock.with_shared(|| Ok(())).expect("shared lock");
        assert!(lock.path().exists());
    }

    #[test]
    fn returns_body_value() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir);
        let value = lock.with_exclusive(|| Ok(7)).expect("exclusive lock");
        assert_eq!(value, 7);
    }

    #[test]
    fn exclusive_excludes_other_threads() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir);
        let held = Arc::new(AtomicBool::new(false));

        let contender_lock = lock.clone();
        let contender_held = Arc::clone(&held);
        let contender = lock
            .with_exclusive(|| {
                held.store(true, Ordering::SeqCst);
                let handle = thread::spawn(move || {
                    contender_lock.with_exclusive(|| {
                        // Must only run after the first holder released.
                        assert!(!contender_held.load(Ordering::SeqCst));
                        Ok(())
                    })
                });
                thread::sleep(Duration::from_millis(100));
                held.store(false, Ordering::SeqCst);
                Ok(handle)
            })
            .expect("exclusive lock");
        contender
            .join()
            .expect("thread join")
            .expect("contender lock");
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir);
        let inner = lock.clone();
        lock.with_shared(move || {
            // A second shared acquisition from another thread must not block.
            let handle = thread::spawn(move || inner.with_shared(|| Ok(())));
            handle.join().expect("thread join")
        })
        .expect("shared locks");
    }

    #[test]
    fn released_after_panic() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir);
        let panicking = lock.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _ = panicking.with_exclusive(|| -> Result<(), SupervisorError> {
                panic!("boom");
            });
        }));
        assert!(result.is_err());
        // The panicking holder must have released the flock on unwind.
        lock.with_exclusive(|| Ok(())).expect("reacquire");
    }
}
