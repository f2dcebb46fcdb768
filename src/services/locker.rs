//! Time-boxed mutual exclusion for concurrent writes.
//!
//! A key is held for at most `ttl`; stale entries are evicted on the next
//! access. Independently of the TTL, no more than `max_active` distinct keys
//! may be held at once.

use crate::errors::{ErrorCode, UploadError, UploadResult};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Locker {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_active: usize,
}

impl Locker {
    pub fn new(ttl: Duration, max_active: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_active,
        }
    }

    /// Take the lock on `key`.
    ///
    /// Fails with `FileLocked` if the key is held and not yet expired, or with
    /// `StorageBusy` if the ceiling of active keys is reached.
    pub fn lock(&self, key: &str) -> UploadResult<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, acquired| now.duration_since(*acquired) < self.ttl);

        if entries.contains_key(key) {
            debug!(key, "lock contention");
            return Err(UploadError::with_message(
                ErrorCode::FileLocked,
                format!("file locked: {key}"),
            ));
        }
        if entries.len() >= self.max_active {
            warn!(active = entries.len(), max = self.max_active, "lock ceiling reached");
            return Err(UploadError::new(ErrorCode::StorageBusy));
        }
        entries.insert(key.to_string(), now);
        Ok(key.to_string())
    }

    pub fn unlock(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Number of keys currently held, counting entries not yet evicted.
    pub fn active(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|acquired| now.duration_since(**acquired) < self.ttl)
            .count()
    }
}

/// Releases its key when dropped, including on early return and cancellation.
#[derive(Debug)]
pub struct LockGuard {
    locker: Arc<Locker>,
    key: String,
}

impl LockGuard {
    pub fn acquire(locker: &Arc<Locker>, key: &str) -> UploadResult<Self> {
        let key = locker.lock(key)?;
        Ok(Self {
            locker: Arc::clone(locker),
            key,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locker.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_key_fails() {
        let locker = Locker::new(Duration::from_secs(60), 10);
        locker.lock("a").unwrap();
        let err = locker.lock("a").unwrap_err();
        assert_eq!(err.code, ErrorCode::FileLocked);
        locker.unlock("a");
        assert!(locker.lock("a").is_ok());
    }

    #[test]
    fn ceiling_rejects_extra_keys() {
        let locker = Locker::new(Duration::from_secs(60), 2);
        locker.lock("a").unwrap();
        locker.lock("b").unwrap();
        let err = locker.lock("c").unwrap_err();
        assert_eq!(err.code, ErrorCode::StorageBusy);
    }

    #[test]
    fn expired_entries_are_evicted() {
        let locker = Locker::new(Duration::from_millis(1), 1);
        locker.lock("a").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(locker.lock("a").is_ok());
    }

    #[test]
    fn guard_releases_on_drop() {
        let locker = Arc::new(Locker::new(Duration::from_secs(60), 1));
        {
            let _guard = LockGuard::acquire(&locker, "a").unwrap();
            assert_eq!(locker.active(), 1);
        }
        assert_eq!(locker.active(), 0);
    }
}
