//! Combines the advisory lock and the store's atomic slot allocation into
//! the single `try_admit` call the supervisor's loop drives.
//!
//! This is the one piece of plumbing that turns two independently correct
//! primitives (an advisory lock, a transactional allocation query) into the
//! cooperative admission protocol: no two processes may ever believe they
//! both hold the same core.

use thiserror::Error;
use tsp_lock::{Lock, LockError};
use tsp_store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Admitted(Vec<u32>),
    Deferred,
}

/// Acquire the host-wide lock, attempt to allocate `requested_slots` of the
/// `total_slots` pool for `uuid`, then release the lock regardless of the
/// outcome. The lock is held only for the duration of the transaction, never
/// across the jittered sleep between attempts.
pub fn try_admit(
    lock: &mut Lock,
    store: &Store,
    uuid: &str,
    total_slots: u32,
    requested_slots: u32,
) -> AdmissionResult<Outcome> {
    lock.acquire()?;
    let result = store.allocate_slots(uuid, total_slots, requested_slots);
    lock.release()?;

    match result? {
        Some(cores) => {
            tracing::debug!(%uuid, ?cores, "admitted");
            Ok(Outcome::Admitted(cores))
        }
        None => {
            tracing::trace!(%uuid, requested_slots, total_slots, "deferred, pool exhausted");
            Ok(Outcome::Deferred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> Store {
        Store::open(&dir.join("tsp_db.sqlite3"), true, false).unwrap()
    }

    #[test]
    fn admits_when_slots_free() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .insert_job("j1", "sleep 1", b"sleep\x001\0\0", None, 1, 1)
            .unwrap();
        let mut lock = Lock::at(dir.path());

        let outcome = try_admit(&mut lock, &store, "j1", 4, 1).unwrap();
        assert_eq!(outcome, Outcome::Admitted(vec![0]));
        assert!(!lock.is_held());
    }

    #[test]
    fn defers_when_pool_exhausted() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .insert_job("j1", "sleep 1", b"sleep\x001\0\0", None, 1, 1)
            .unwrap();
        store
            .insert_job("j2", "sleep 1", b"sleep\x001\0\0", None, 2, 1)
            .unwrap();
        let mut lock = Lock::at(dir.path());

        assert_eq!(
            try_admit(&mut lock, &store, "j1", 1, 1).unwrap(),
            Outcome::Admitted(vec![0])
        );
        assert_eq!(try_admit(&mut lock, &store, "j2", 1, 1).unwrap(), Outcome::Deferred);
        assert!(!lock.is_held());
    }
}
