//! Spin-wait locks for dog-pile protection.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::traits::CacheStore;

/// Retries attempted by [`LockManager::lock`] before giving up.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// Lock record TTL used when none is configured.
pub const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(30);

/// Value stored in a lock record; only its existence matters.
const LOCK_SENTINEL: &[u8] = b"1";

/// Backoff bounds between attempts, in microseconds.
const BACKOFF_MICROS: std::ops::RangeInclusive<u64> = 10..=1000;

/// Acquires and releases lock records through a store's atomic `add`.
///
/// At most one caller holds a given lock record at a time, as far as the
/// backend's create-if-absent is atomic. There is no fairness or queueing,
/// and a lock not released explicitly disappears when its TTL runs out.
#[derive(Debug, Clone, Copy)]
pub struct LockManager {
    expire: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_EXPIRE)
    }
}

impl LockManager {
    /// Create a lock manager whose records live for `expire`.
    pub fn new(expire: Duration) -> Self {
        Self { expire }
    }

    /// TTL of lock records.
    pub fn expire(&self) -> Duration {
        self.expire
    }

    /// Try to create the lock record, retrying up to `max_iterations` times
    /// with a random 10–1000 µs pause between attempts.
    pub async fn lock(
        &self,
        store: &dyn CacheStore,
        lock_key: &str,
        max_iterations: u32,
    ) -> CacheResult<bool> {
        let mut attempts = 0;

        loop {
            if store
                .add(lock_key, LOCK_SENTINEL.to_vec(), Some(self.expire))
                .await?
            {
                debug!(lock = %lock_key, attempts, "Acquired lock");
                return Ok(true);
            }

            attempts += 1;
            if attempts > max_iterations {
                warn!(lock = %lock_key, attempts, "Failed to acquire lock");
                return Ok(false);
            }

            let pause = rand::rng().random_range(BACKOFF_MICROS);
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }
    }

    /// Delete the lock record. Returns whether one existed.
    pub async fn unlock(&self, store: &dyn CacheStore, lock_key: &str) -> CacheResult<bool> {
        let released = store.delete(lock_key).await?;
        if released {
            debug!(lock = %lock_key, "Released lock");
        }
        Ok(released)
    }
}
