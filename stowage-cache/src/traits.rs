//! Cache store trait definition.

use crate::error::CacheResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Backend diagnostics, keyed by statistic name.
pub type StoreStatus = BTreeMap<String, String>;

/// Byte-level capability set every cache backend provides.
///
/// Keys passed to a store are storage keys: already prefixed and hashed.
/// A TTL of `None` means the entry never expires.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Get the raw bytes stored under `key`.
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(bytes))` if the key exists, `Ok(None)` if not found,
    /// or an error if the operation fails.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any existing entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Store `value` only if `key` is absent.
    ///
    /// Must be atomic: of several concurrent callers at most one gets `true`.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Store `value` only if `key` already exists.
    async fn replace(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> CacheResult<bool>;

    /// Delete a key. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Check if a key exists in the cache.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Reset the TTL of an existing key. Returns `false` if the key is absent.
    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Add `delta` to the integer stored under `key` and return the new value.
    ///
    /// The key must exist; a missing key is reported as
    /// [`CacheError::Missing`](crate::CacheError::Missing).
    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// Remove every entry from the store.
    ///
    /// **Warning:** This operation affects all keys, not only this cache's prefix.
    async fn clear(&self) -> CacheResult<()>;

    /// Enumerate the storage keys currently held.
    async fn keys(&self) -> CacheResult<Vec<String>> {
        Err(crate::CacheError::unsupported(self.name(), "keys"))
    }

    /// Backend statistics.
    async fn status(&self) -> CacheResult<StoreStatus> {
        Err(crate::CacheError::unsupported(self.name(), "status"))
    }

    // ========== Batch Operations (Parallel) ==========

    /// Get multiple keys in parallel.
    ///
    /// Absent keys are left out of the returned map.
    async fn get_many(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        use futures::future::try_join_all;

        let futures = keys.iter().map(|key| async move {
            self.get(key)
                .await
                .map(|value| value.map(|v| (key.to_string(), v)))
        });

        Ok(try_join_all(futures).await?.into_iter().flatten().collect())
    }

    /// Delete multiple keys in parallel. Returns the number of keys removed.
    async fn delete_many(&self, keys: &[&str]) -> CacheResult<usize> {
        use futures::future::try_join_all;

        let futures = keys.iter().map(|key| self.delete(key));
        let removed = try_join_all(futures).await?;
        Ok(removed.into_iter().filter(|r| *r).count())
    }
}

/// Shared, type-erased store.
pub type DynStore = Arc<dyn CacheStore>;

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        (**self).add(key, value, ttl).await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        (**self).replace(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        (**self).exists(key).await
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        (**self).touch(key, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        (**self).increment(key, delta).await
    }

    async fn clear(&self) -> CacheResult<()> {
        (**self).clear().await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        (**self).keys().await
    }

    async fn status(&self) -> CacheResult<StoreStatus> {
        (**self).status().await
    }

    async fn get_many(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        (**self).get_many(keys).await
    }

    async fn delete_many(&self, keys: &[&str]) -> CacheResult<usize> {
        (**self).delete_many(keys).await
    }
}
