//! A single host-wide advisory file lock that serialises admission
//! transactions across concurrent spooler processes.
//!
//! SQLite's own busy-timeout is enough to keep the database consistent, but
//! without this lock every spooler would hammer `BEGIN IMMEDIATE` in a tight
//! loop whenever a slot frees up. The lock flattens that into a predictable
//! hand-off, and doubles as a signal mask: while the critical section is
//! open, fatal signals are deferred just long enough to release the lock
//! cleanly instead of leaving the database mid-transaction.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not open lock file {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("flock({0:?}) failed: {1}")]
    Flock(&'static str, std::io::Error),
    #[error("lock is not held")]
    NotHeld,
}

pub type LockResult<T> = Result<T, LockError>;

/// Signals that would otherwise terminate the process and so must be
/// deferred while the advisory lock is held.
const MASKED_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGHUP, libc::SIGTERM];

/// The fd of the lock currently held by this process, or `-1` if none.
/// Read and written from the signal handler, so it must stay lock-free.
static HELD_FD: AtomicI32 = AtomicI32::new(-1);

/// Previous signal dispositions, indexed the same way as `MASKED_SIGNALS`,
/// stored as the raw `sighandler_t` value so the handler can chain to them
/// without allocating.
static PREV_HANDLERS: [AtomicUsize; MASKED_SIGNALS.len()] =
    [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)];

extern "C" fn release_and_chain(sig: libc::c_int) {
    let fd = HELD_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }
    if let Some(index) = MASKED_SIGNALS.iter().position(|&s| s == sig) {
        let prev = PREV_HANDLERS[index].load(Ordering::SeqCst);
        // SIG_DFL (0) and SIG_IGN (1) aren't callable function pointers;
        // re-arm them and re-raise so the kernel applies the default
        // action (or ignores it) instead of us reimplementing it.
        if prev == libc::SIG_DFL || prev == libc::SIG_IGN {
            unsafe {
                libc::signal(sig, prev);
                libc::raise(sig);
            }
        } else if prev != 0 {
            let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(prev) };
            handler(sig);
        }
    }
}

/// The host-wide advisory lock. One instance per process is expected; it is
/// not `Sync` because `sigaction` state is process-global.
pub struct Lock {
    path: PathBuf,
    fd: Option<RawFd>,
}

impl Lock {
    /// `<tmp>/.affinity_lock_file.lock`, matching the path every cooperating
    /// spooler on the host agrees on.
    pub fn at(tmp_dir: &Path) -> Self {
        Self {
            path: tmp_dir.join(".affinity_lock_file.lock"),
            fd: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.fd.is_some()
    }

    /// Block until the exclusive lock is acquired, then mask fatal signals
    /// for the duration of the critical section.
    pub fn acquire(&mut self) -> LockResult<()> {
        let c_path = CString::new(self.path.as_os_str().to_string_lossy().as_bytes())
            .expect("lock path must not contain a NUL byte");
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CREAT, 0o600) };
        if fd < 0 {
            return Err(LockError::Open(self.path.clone(), std::io::Error::last_os_error()));
        }

        if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(LockError::Flock("LOCK_EX", err));
        }

        HELD_FD.store(fd, Ordering::SeqCst);
        for (index, &sig) in MASKED_SIGNALS.iter().enumerate() {
            let prev = unsafe { libc::signal(sig, release_and_chain as usize) };
            PREV_HANDLERS[index].store(prev, Ordering::SeqCst);
        }

        self.fd = Some(fd);
        tracing::trace!(path = ?self.path, "lock acquired");
        Ok(())
    }

    /// Restore the previous signal handlers and drop the lock. Idempotent:
    /// calling `release` when not held is a no-op error, not a panic, since
    /// the signal handler may have already released it concurrently.
    pub fn release(&mut self) -> LockResult<()> {
        let fd = self.fd.take().ok_or(LockError::NotHeld)?;

        for (index, &sig) in MASKED_SIGNALS.iter().enumerate() {
            let prev = PREV_HANDLERS[index].load(Ordering::SeqCst);
            if prev != 0 {
                unsafe { libc::signal(sig, prev) };
            }
        }

        // The handler may have already unlocked and cleared HELD_FD if a
        // signal arrived between acquire() and here; flock(LOCK_UN) on an
        // already-unlocked fd is harmless.
        HELD_FD.compare_exchange(fd, -1, Ordering::SeqCst, Ordering::SeqCst).ok();
        let rc = unsafe { libc::flock(fd, libc::LOCK_UN) };
        unsafe { libc::close(fd) };
        if rc != 0 {
            return Err(LockError::Flock("LOCK_UN", std::io::Error::last_os_error()));
        }
        tracing::trace!(path = ?self.path, "lock released");
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.fd.is_some() {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_release_round_trips() {
        let dir = tempdir().unwrap();
        let mut lock = Lock::at(dir.path());
        assert!(!lock.is_held());
        lock.acquire().unwrap();
        assert!(lock.is_held());
        lock.release().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn release_without_acquire_errors() {
        let dir = tempdir().unwrap();
        let mut lock = Lock::at(dir.path());
        assert!(matches!(lock.release(), Err(LockError::NotHeld)));
    }

    #[test]
    fn drop_releases_held_lock() {
        let dir = tempdir().unwrap();
        {
            let mut lock = Lock::at(dir.path());
            lock.acquire().unwrap();
        }
        // A second acquire from the same process must succeed immediately;
        // if Drop hadn't released it, flock(LOCK_EX) on the same fd family
        // would still succeed too (same-process locks don't self-deadlock),
        // but the file must exist and be lockable.
        let mut lock = Lock::at(dir.path());
        lock.acquire().unwrap();
        lock.release().unwrap();
    }
}
