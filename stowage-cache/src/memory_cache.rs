//! In-process cache store.

use crate::error::{CacheError, CacheResult};
use crate::traits::{CacheStore, StoreStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// In-memory cache backed by a `HashMap` behind an async `RwLock`.
///
/// Clones share the same data. Expired entries are treated as absent and
/// dropped lazily by writers or [`InMemoryCache::cleanup_expired`].
#[derive(Clone, Default)]
pub struct InMemoryCache {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Deadline `ttl` after `now`; a TTL past the clock's range never expires.
fn expiry(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|d| now.checked_add(d))
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: expiry(Instant::now(), ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }
}

impl InMemoryCache {
    /// Create new in-memory cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries. Returns the number removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut data = self.data.write().await;
        let before = data.len();
        let now = Instant::now();
        data.retain(|_, entry| entry.is_live(now));
        before - data.len()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let entry = CacheEntry::new(value, ttl);
        self.data.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|e| e.is_live(Instant::now())) {
            return Ok(false);
        }
        data.insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(true)
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut data = self.data.write().await;
        match data.get_mut(key) {
            Some(entry) if entry.is_live(Instant::now()) => {
                *entry = CacheEntry::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self.data.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(Instant::now())))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.get(key).await.map(|v| v.is_some())
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        match data.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut data = self.data.write().await;
        let entry = data
            .get_mut(key)
            .filter(|e| e.is_live(Instant::now()))
            .ok_or_else(|| CacheError::missing(key))?;

        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| CacheError::Other(format!("Value at '{}' is not an integer", key)))?;

        let new_value = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Other(format!("Counter '{}' overflowed", key)))?;
        entry.value = new_value.to_string().into_bytes();

        Ok(new_value)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.data.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn status(&self) -> CacheResult<StoreStatus> {
        let data = self.data.read().await;
        let now = Instant::now();
        let live = data.values().filter(|e| e.is_live(now)).count();
        let bytes: usize = data.values().map(|e| e.value.len()).sum();

        Ok(StoreStatus::from([
            ("entries".to_string(), data.len().to_string()),
            ("live_entries".to_string(), live.to_string()),
            ("bytes".to_string(), bytes.to_string()),
        ]))
    }
}
