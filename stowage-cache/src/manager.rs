//! High-level cache manager.
//!
//! [`CacheManager`] is the facade applications talk to. It prepares keys and
//! tags, encodes values, keeps tag records current and guards recomputation
//! with locks, delegating storage to a [`CacheStore`].

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{CacheBackend, CacheConfig, TagMode};
use crate::error::{CacheError, CacheResult};
use crate::file_cache::FileCache;
use crate::invalidation::{KeyListIndex, TagIndex, TagValue};
use crate::key::{KeyCodec, LOCK_PREFIX, TAG_PREFIX};
use crate::lock::{DEFAULT_MAX_ITERATIONS, LockManager};
use crate::memory_cache::InMemoryCache;
use crate::serializer::{DecodeMode, Serializer, from_value, to_value};
use crate::traits::{CacheStore, DynStore, StoreStatus};
use crate::versioning::VersionedIndex;

/// Cache manager over a store chosen at runtime.
pub type SharedCacheManager = CacheManager<DynStore>;

/// High-level cache manager.
///
/// Holds only configuration fixed at construction and a shared handle to
/// the store; clones share the store. Multi-key operations iterate the
/// single-key ones and are not atomic as a whole.
pub struct CacheManager<S: CacheStore> {
    store: Arc<S>,
    codec: KeyCodec,
    serializer: Serializer,
    tags: Arc<dyn TagIndex>,
    locks: LockManager,
    default_ttl: Option<Duration>,
}

impl<S: CacheStore> Clone for CacheManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            codec: self.codec.clone(),
            serializer: self.serializer,
            tags: self.tags.clone(),
            locks: self.locks,
            default_ttl: self.default_ttl,
        }
    }
}

impl<S: CacheStore> CacheManager<S> {
    /// Create a cache manager with the default configuration.
    pub fn new(store: S) -> Self {
        Self::build(Arc::new(store), &CacheConfig::default())
    }

    /// Create a cache manager with `config`'s key, tag, serializer and lock
    /// settings. The backend fields of `config` are ignored.
    pub fn with_config(store: S, config: &CacheConfig) -> CacheResult<Self> {
        Self::from_shared(Arc::new(store), config)
    }

    /// Same as [`CacheManager::with_config`] over an already shared store.
    pub fn from_shared(store: Arc<S>, config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    fn build(store: Arc<S>, config: &CacheConfig) -> Self {
        let serializer = config.serializer();
        let tags: Arc<dyn TagIndex> = match config.tag_mode {
            TagMode::KeyList => Arc::new(KeyListIndex::new(serializer)),
            TagMode::Versioning => Arc::new(VersionedIndex::new()),
        };

        Self {
            store,
            codec: config.codec(),
            serializer,
            tags,
            locks: LockManager::new(config.lock_expire),
            default_ttl: config.default_ttl.filter(|ttl| !ttl.is_zero()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Key codec in use.
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Tag invalidation strategy in use.
    pub fn tag_mode(&self) -> TagMode {
        self.tags.mode()
    }

    /// Storage key for `key`, or `None` if the key is invalid.
    pub fn prepare_key(&self, key: &str) -> Option<String> {
        self.codec.prepare_key(key)
    }

    /// Zero means "never"; `None` falls back to the configured default.
    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        match ttl {
            Some(ttl) if ttl.is_zero() => None,
            Some(ttl) => Some(ttl),
            None => self.default_ttl,
        }
    }

    /// Read, decode and validate the entry at a storage key.
    async fn fetch(&self, storage_key: &str) -> CacheResult<Option<Value>> {
        let Some(bytes) = self.store.get(storage_key).await? else {
            return Ok(None);
        };

        let value = self.serializer.decode(&bytes, DecodeMode::Lenient)?;
        self.tags.unwrap_entry(&*self.store, storage_key, value).await
    }

    /// Encode a value, embedding tag stamps when the tag
    /// strategy uses them. Tag membership is recorded separately, after the
    /// write.
    async fn encode_entry(&self, value: Value, storage_tags: &[String]) -> CacheResult<Vec<u8>> {
        let snapshot = self.tags.snapshot(&*self.store, storage_tags).await?;
        let value = self.tags.wrap_entry(value, snapshot)?;
        self.serializer.encode(&value)
    }

    // ========== Single-key Operations ==========

    /// Get a value from the cache.
    ///
    /// Returns [`CacheError::Missing`] when the key is absent, stale or
    /// invalid.
    pub async fn get(&self, key: &str) -> CacheResult<Value> {
        let storage_key = self
            .codec
            .prepare_key(key)
            .ok_or_else(|| CacheError::missing(key))?;

        self.fetch(&storage_key)
            .await?
            .ok_or_else(|| CacheError::missing(key))
    }

    /// Get a typed value from the cache.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        from_value(self.get(key).await?)
    }

    /// Store a value, tagging it with `tags`.
    ///
    /// Returns `false` if the key is invalid.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool> {
        let Some(storage_key) = self.codec.prepare_key(key) else {
            return Ok(false);
        };

        let storage_tags = self.codec.prepare_tags(tags);
        let bytes = self.encode_entry(to_value(value)?, &storage_tags).await?;
        self.store
            .set(&storage_key, bytes, self.effective_ttl(ttl))
            .await?;
        self.tags
            .attach(&*self.store, &storage_key, &storage_tags)
            .await?;
        Ok(true)
    }

    /// Store a value only if the key is absent.
    ///
    /// Returns `false` if the key exists or is invalid; the existing value is
    /// left untouched.
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool> {
        let Some(storage_key) = self.codec.prepare_key(key) else {
            return Ok(false);
        };

        let storage_tags = self.codec.prepare_tags(tags);
        let bytes = self.encode_entry(to_value(value)?, &storage_tags).await?;
        let added = self
            .store
            .add(&storage_key, bytes, self.effective_ttl(ttl))
            .await?;

        if added {
            self.tags
                .attach(&*self.store, &storage_key, &storage_tags)
                .await?;
        }
        Ok(added)
    }

    /// Check if a key holds a current value.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let Some(storage_key) = self.codec.prepare_key(key) else {
            return Ok(false);
        };

        match self.tags.mode() {
            TagMode::KeyList => self.store.exists(&storage_key).await,
            // Stale entries only show up as such once read.
            TagMode::Versioning => Ok(self.fetch(&storage_key).await?.is_some()),
        }
    }

    /// Reset the TTL of an existing key.
    pub async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let Some(storage_key) = self.codec.prepare_key(key) else {
            return Ok(false);
        };

        self.store
            .touch(&storage_key, self.effective_ttl(ttl))
            .await
    }

    /// Add `offset` to a counter and return the new value.
    ///
    /// A missing counter is reported as [`CacheError::Missing`] unless
    /// `create` is set, in which case it starts from zero with `ttl`.
    pub async fn increment(
        &self,
        key: &str,
        offset: i64,
        ttl: Option<Duration>,
        create: bool,
    ) -> CacheResult<i64> {
        let storage_key = self
            .codec
            .prepare_key(key)
            .ok_or_else(|| CacheError::missing(key))?;

        match self.store.increment(&storage_key, offset).await {
            Err(e) if e.is_missing() && create => {
                // A concurrent creator may win the add; either way the counter now exists.
                self.store
                    .add(&storage_key, b"0".to_vec(), self.effective_ttl(ttl))
                    .await?;
                self.store.increment(&storage_key, offset).await
            }
            Err(e) if e.is_missing() => Err(CacheError::missing(key)),
            result => result,
        }
    }

    /// Subtract `offset` from a counter and return the new value.
    pub async fn decrement(
        &self,
        key: &str,
        offset: i64,
        ttl: Option<Duration>,
        create: bool,
    ) -> CacheResult<i64> {
        self.increment(key, offset.saturating_neg(), ttl, create)
            .await
    }

    /// Delete a key. Returns `false` if it was missing.
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let Some(storage_key) = self.codec.prepare_key(key) else {
            return Ok(false);
        };

        self.store.delete(&storage_key).await
    }

    // ========== Multi-key Operations ==========

    /// Get several values; missing keys are left out.
    pub async fn get_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, Value>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Ok(value) => {
                    found.insert(key.to_string(), value);
                }
                Err(e) if e.is_missing() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Store several values with the same TTL and tags. Returns the outcome
    /// per key.
    pub async fn set_multi<T: Serialize>(
        &self,
        items: &[(&str, T)],
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(items.len());
        for (key, value) in items {
            let stored = self.set(key, value, ttl, tags).await?;
            outcome.insert(key.to_string(), stored);
        }
        Ok(outcome)
    }

    /// Reset the TTL of several keys. Returns the outcome per key.
    pub async fn touch_multi(
        &self,
        keys: &[&str],
        ttl: Option<Duration>,
    ) -> CacheResult<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(keys.len());
        for key in keys {
            outcome.insert(key.to_string(), self.touch(key, ttl).await?);
        }
        Ok(outcome)
    }

    /// Delete several keys. Returns the outcome per key.
    pub async fn remove_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(keys.len());
        for key in keys {
            outcome.insert(key.to_string(), self.remove(key).await?);
        }
        Ok(outcome)
    }

    // ========== Tags ==========

    /// Current value of a tag: its member keys in key-list mode, its stamp in
    /// versioning mode.
    pub async fn get_tag(&self, tag: &str) -> CacheResult<TagValue> {
        let storage_tag = self
            .codec
            .prepare_tag(tag)
            .ok_or_else(|| CacheError::missing(tag))?;

        self.tags
            .read(&*self.store, &storage_tag)
            .await?
            .ok_or_else(|| CacheError::missing(tag))
    }

    /// Values of several tags in request order; absent tags are skipped.
    pub async fn get_multi_tags(&self, tags: &[&str]) -> CacheResult<Vec<(String, TagValue)>> {
        let mut seen = HashSet::new();
        let requested: Vec<(&str, String)> = tags
            .iter()
            .filter(|tag| seen.insert(**tag))
            .filter_map(|tag| self.codec.prepare_tag(tag).map(|st| (*tag, st)))
            .collect();

        let storage_tags: Vec<String> = requested.iter().map(|(_, st)| st.clone()).collect();
        let mut found = self.tags.read_many(&*self.store, &storage_tags).await?;

        Ok(requested
            .into_iter()
            .filter_map(|(tag, st)| found.remove(&st).map(|value| (tag.to_string(), value)))
            .collect())
    }

    /// Check if a tag record exists.
    pub async fn exists_tag(&self, tag: &str) -> CacheResult<bool> {
        let Some(storage_tag) = self.codec.prepare_tag(tag) else {
            return Ok(false);
        };

        self.store.exists(&storage_tag).await
    }

    /// Invalidate every entry carrying `tag`. Returns `false` if the tag
    /// record does not exist.
    pub async fn remove_tag(&self, tag: &str) -> CacheResult<bool> {
        let Some(storage_tag) = self.codec.prepare_tag(tag) else {
            return Ok(false);
        };

        self.tags.invalidate(&*self.store, &storage_tag).await
    }

    /// Invalidate several tags. Returns the outcome per tag.
    pub async fn remove_multi_tags(&self, tags: &[&str]) -> CacheResult<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(tags.len());
        for tag in tags {
            outcome.insert(tag.to_string(), self.remove_tag(tag).await?);
        }
        Ok(outcome)
    }

    // ========== Enumeration ==========

    /// Storage keys of this cache's entries, sorted.
    ///
    /// Tag and lock records and keys outside the configured prefix are left
    /// out. Fails with [`CacheError::Unsupported`] on backends that cannot
    /// enumerate their keyspace.
    pub async fn get_all_keys(&self) -> CacheResult<Vec<String>> {
        let prefix = self.codec.prefix();
        let mut keys: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| !k.starts_with(TAG_PREFIX) && !k.starts_with(LOCK_PREFIX))
            .collect();

        keys.sort();
        Ok(keys)
    }

    /// Every current entry of this cache, keyed by storage key.
    pub async fn get_all(&self) -> CacheResult<HashMap<String, Value>> {
        let mut entries = HashMap::new();
        for storage_key in self.get_all_keys().await? {
            if let Some(value) = self.fetch(&storage_key).await? {
                entries.insert(storage_key, value);
            }
        }
        Ok(entries)
    }

    // ========== Locks ==========

    /// Acquire the lock guarding `key`, retrying the default number of times.
    pub async fn lock(&self, key: &str) -> CacheResult<bool> {
        self.lock_with(key, DEFAULT_MAX_ITERATIONS).await
    }

    /// Acquire the lock guarding `key`, retrying up to `max_iterations` times.
    pub async fn lock_with(&self, key: &str, max_iterations: u32) -> CacheResult<bool> {
        let Some(lock_key) = self.codec.prepare_lock(key) else {
            return Ok(false);
        };

        self.locks.lock(&*self.store, &lock_key, max_iterations).await
    }

    /// Release the lock guarding `key`.
    pub async fn unlock(&self, key: &str) -> CacheResult<bool> {
        let Some(lock_key) = self.codec.prepare_lock(key) else {
            return Ok(false);
        };

        self.locks.unlock(&*self.store, &lock_key).await
    }

    /// Get a cached value or compute and store it.
    ///
    /// On a miss the key's lock is taken before computing, so concurrent
    /// callers wait for the first one and then read its result instead of
    /// recomputing. If the lock cannot be taken the value is computed anyway.
    pub async fn remember<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[&str],
        factory: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        match self.get_as::<T>(key).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_missing() => {}
            Err(e) => return Err(e),
        }

        let locked = self.lock(key).await?;

        let result = async {
            if locked {
                match self.get_as::<T>(key).await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_missing() => {}
                    Err(e) => return Err(e),
                }
            }

            debug!(key = %key, locked, "Computing cache value");
            let value = factory().await?;
            self.set(key, &value, ttl, tags).await?;
            Ok(value)
        }
        .await;

        if locked {
            let released = self.unlock(key).await;
            if result.is_ok() {
                released?;
            }
        }

        result
    }

    // ========== Store-wide ==========

    /// Remove every entry from the backend, not only this cache's prefix.
    pub async fn flush(&self) -> CacheResult<()> {
        self.store.clear().await
    }

    /// Backend diagnostics.
    pub async fn status(&self) -> CacheResult<StoreStatus> {
        self.store.status().await
    }
}

/// Open the backend described by `config` and wrap it in a cache manager.
///
/// # Examples
///
/// ```
/// use stowage_cache::*;
///
/// # async fn example() -> CacheResult<()> {
/// let cache = connect(&CacheConfig::memory()).await?;
/// cache.set("greeting", "hello", None, &["demo"]).await?;
/// assert_eq!(cache.get("greeting").await?, "hello");
/// # Ok(())
/// # }
/// ```
pub async fn connect(config: &CacheConfig) -> CacheResult<SharedCacheManager> {
    config.validate()?;

    let store: DynStore = match config.backend {
        CacheBackend::Memory => Arc::new(InMemoryCache::new()),
        CacheBackend::File => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| CacheError::Config("File backend requires a root path".into()))?;
            Arc::new(FileCache::new(path).await?)
        }
        #[cfg(feature = "redis")]
        CacheBackend::Redis => Arc::new(crate::redis_cache::RedisCache::new(config).await?),
        #[cfg(feature = "memcached")]
        CacheBackend::Memcached => {
            Arc::new(crate::memcached_cache::MemcachedCache::new(config).await?)
        }
        #[allow(unreachable_patterns)]
        backend => {
            return Err(CacheError::Config(format!(
                "{} backend support is not compiled in",
                backend
            )));
        }
    };

    debug!(backend = %config.backend, store = store.name(), "Opened cache store");
    CacheManager::with_config(store, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::HashMode;
    use serde::Deserialize;
    use serde_json::json;

    fn plain_config() -> CacheConfig {
        CacheConfig::memory().with_key_hash(HashMode::None)
    }

    fn manager(config: &CacheConfig) -> CacheManager<InMemoryCache> {
        CacheManager::with_config(InMemoryCache::new(), config).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let cache = CacheManager::new(InMemoryCache::new());

        assert!(cache.set("key1", "one", None, &[]).await.unwrap());
        assert_eq!(cache.get("key1").await.unwrap(), json!("one"));
        assert!(cache.exists("key1").await.unwrap());

        assert!(cache.remove("key1").await.unwrap());
        assert!(!cache.remove("key1").await.unwrap());
        assert!(cache.get("key1").await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let cache = CacheManager::new(InMemoryCache::new());

        assert!(!cache.set("", "x", None, &[]).await.unwrap());
        assert!(!cache.add("", "x", None, &[]).await.unwrap());
        assert!(!cache.exists("").await.unwrap());
        assert!(!cache.remove("").await.unwrap());
        assert!(!cache.lock("").await.unwrap());
        assert!(cache.get("").await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_storage_key_uses_prefix_and_hash() {
        let cache = manager(&CacheConfig::memory().with_key_prefix("app"));
        cache.set("key1", &1, None, &[]).await.unwrap();

        let storage_key = cache.prepare_key("key1").unwrap();
        assert_eq!(storage_key, "app_c2add694bf942dc77b376592d9c862cd");
        assert!(cache.store().exists(&storage_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Profile {
            name: String,
            roles: Vec<String>,
        }

        let cache = CacheManager::new(InMemoryCache::new());
        let profile = Profile {
            name: "Alice".to_string(),
            roles: vec!["admin".to_string()],
        };

        cache.set("profile:1", &profile, None, &[]).await.unwrap();
        let cached: Profile = cache.get_as("profile:1").await.unwrap();
        assert_eq!(cached, profile);
    }

    #[tokio::test]
    async fn test_add_keeps_original_value() {
        let cache = CacheManager::new(InMemoryCache::new());

        assert!(cache.add("key", "first", None, &[]).await.unwrap());
        assert!(!cache.add("key", "second", None, &[]).await.unwrap());
        assert_eq!(cache.get("key").await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_rejected_add_does_not_tag_existing_entry() {
        for mode in [TagMode::KeyList, TagMode::Versioning] {
            let cache = manager(&CacheConfig::memory().with_tag_mode(mode));

            assert!(cache.set("k", "orig", None, &[]).await.unwrap());
            assert!(!cache.add("k", "second", None, &["t"]).await.unwrap());

            if mode == TagMode::KeyList {
                assert!(!cache.exists_tag("t").await.unwrap());
            }
            cache.remove_tag("t").await.unwrap();
            assert_eq!(cache.get("k").await.unwrap(), json!("orig"));
        }
    }

    #[tokio::test]
    async fn test_successful_add_is_tagged() {
        for mode in [TagMode::KeyList, TagMode::Versioning] {
            let cache = manager(&CacheConfig::memory().with_tag_mode(mode));

            assert!(cache.add("k", "v", None, &["t"]).await.unwrap());
            assert!(cache.remove_tag("t").await.unwrap());
            assert!(cache.get("k").await.unwrap_err().is_missing());
        }
    }

    #[tokio::test]
    async fn test_reserved_prefix_is_rejected() {
        for prefix in ["tag", "lock", "tag_x", "lock_"] {
            let config = CacheConfig::memory().with_key_prefix(prefix);
            let err = CacheManager::with_config(InMemoryCache::new(), &config)
                .err()
                .unwrap();
            assert!(matches!(err, CacheError::Config(_)), "prefix {}", prefix);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_touch() {
        let cache = CacheManager::new(InMemoryCache::new());

        cache
            .set("short", "v", Some(Duration::from_secs(1)), &[])
            .await
            .unwrap();
        cache
            .set("touched", "v", Some(Duration::from_secs(1)), &[])
            .await
            .unwrap();
        assert!(cache
            .touch("touched", Some(Duration::from_secs(10)))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.get("short").await.unwrap_err().is_missing());
        assert!(!cache.exists("short").await.unwrap());
        assert!(cache.exists("touched").await.unwrap());
        assert!(!cache.touch("short", None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies_when_none_given() {
        let config = CacheConfig::memory().with_default_ttl(Duration::from_secs(5));
        let cache = manager(&config);

        cache.set("defaulted", "v", None, &[]).await.unwrap();
        cache
            .set("forever", "v", Some(Duration::ZERO), &[])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.exists("defaulted").await.unwrap());
        assert!(cache.exists("forever").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let cache = CacheManager::new(InMemoryCache::new());

        let err = cache.increment("hits", 1, None, false).await.unwrap_err();
        assert!(err.is_missing());

        assert_eq!(cache.increment("hits", 2, None, true).await.unwrap(), 2);
        assert_eq!(cache.increment("hits", 3, None, false).await.unwrap(), 5);
        assert_eq!(cache.decrement("hits", 1, None, false).await.unwrap(), 4);
        assert_eq!(cache.get("hits").await.unwrap(), json!(4));

        cache.set("stock", &10, None, &[]).await.unwrap();
        assert_eq!(cache.decrement("stock", 4, None, false).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_multi_operations() {
        let cache = CacheManager::new(InMemoryCache::new());

        let stored = cache
            .set_multi(&[("a", 1), ("b", 2), ("", 3)], None, &[])
            .await
            .unwrap();
        assert_eq!(stored["a"], true);
        assert_eq!(stored[""], false);

        let found = cache.get_multi(&["a", "b", "c"]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], json!(2));

        let touched = cache.touch_multi(&["a", "c"], None).await.unwrap();
        assert_eq!(touched["a"], true);
        assert_eq!(touched["c"], false);

        let removed = cache.remove_multi(&["a", "b", "c"]).await.unwrap();
        assert_eq!(removed.values().filter(|r| **r).count(), 2);
        assert!(cache.get_multi(&["a", "b"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_list_tag_scenario() {
        let cache = CacheManager::new(InMemoryCache::new());

        cache
            .set("key1", &["one", "two"], None, &["foo", "bar"])
            .await
            .unwrap();
        cache.set("key2", "three", None, &["foo"]).await.unwrap();

        let mut expected = vec![
            cache.prepare_key("key1").unwrap(),
            cache.prepare_key("key2").unwrap(),
        ];
        expected.sort();
        assert_eq!(
            cache.get_tag("foo").await.unwrap(),
            TagValue::Members(expected)
        );

        assert!(cache.remove_tag("bar").await.unwrap());
        assert!(cache.get("key1").await.unwrap_err().is_missing());
        assert_eq!(cache.get("key2").await.unwrap(), json!("three"));
        assert!(!cache.exists_tag("bar").await.unwrap());
        assert!(!cache.remove_tag("bar").await.unwrap());
    }

    #[tokio::test]
    async fn test_key_list_invalidation_removes_all_members() {
        let cache = CacheManager::new(InMemoryCache::new());

        cache.set("k1", "v", None, &["t"]).await.unwrap();
        cache.set("k2", "v", None, &["t"]).await.unwrap();
        assert!(cache.exists_tag("t").await.unwrap());

        assert!(cache.remove_tag("t").await.unwrap());
        assert!(!cache.exists("k1").await.unwrap());
        assert!(!cache.exists("k2").await.unwrap());
        assert!(!cache.exists_tag("t").await.unwrap());
        assert!(cache.get_tag("t").await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_versioning_makes_entries_stale() {
        let config = plain_config().with_tag_mode(TagMode::Versioning);
        let cache = manager(&config);

        cache.set("k", &["one", "two"], None, &["t"]).await.unwrap();
        cache.set("other", "kept", None, &["u"]).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), json!(["one", "two"]));
        let stamp = cache.get_tag("t").await.unwrap().version().unwrap();

        assert!(cache.remove_tag("t").await.unwrap());
        assert!(cache.get_tag("t").await.unwrap().version().unwrap() > stamp);

        // The raw record is still there until it is read.
        assert!(cache.store().exists("k").await.unwrap());
        assert!(cache.get("k").await.unwrap_err().is_missing());
        assert!(!cache.store().exists("k").await.unwrap());

        assert_eq!(cache.get("other").await.unwrap(), json!("kept"));
        assert!(!cache.remove_tag("never-used").await.unwrap());
    }

    #[tokio::test]
    async fn test_versioning_rewrite_after_invalidation_is_fresh() {
        let config = plain_config().with_tag_mode(TagMode::Versioning);
        let cache = manager(&config);

        cache.set("k", "old", None, &["t"]).await.unwrap();
        cache.remove_tag("t").await.unwrap();
        assert!(!cache.exists("k").await.unwrap());

        cache.set("k", "new", None, &["t"]).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn test_versioning_counters_are_not_enveloped() {
        let config = plain_config().with_tag_mode(TagMode::Versioning);
        let cache = manager(&config);

        assert_eq!(cache.increment("n", 5, None, true).await.unwrap(), 5);
        assert_eq!(cache.get("n").await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_get_multi_tags_in_request_order() {
        let cache = CacheManager::new(InMemoryCache::new());

        cache.set("k1", "v", None, &["b"]).await.unwrap();
        cache.set("k2", "v", None, &["a"]).await.unwrap();

        let tags = cache
            .get_multi_tags(&["b", "missing", "a", "b"])
            .await
            .unwrap();
        let names: Vec<&str> = tags.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_remove_multi_tags() {
        let cache = CacheManager::new(InMemoryCache::new());
        cache.set("k1", "v", None, &["a"]).await.unwrap();

        let outcome = cache.remove_multi_tags(&["a", "b"]).await.unwrap();
        assert_eq!(outcome["a"], true);
        assert_eq!(outcome["b"], false);
    }

    #[tokio::test]
    async fn test_get_all_skips_bookkeeping_records() {
        let cache = manager(&plain_config().with_key_prefix("app"));

        cache.set("k1", "one", None, &["t"]).await.unwrap();
        cache.set("k2", &2, None, &[]).await.unwrap();
        cache.lock("k1").await.unwrap();
        cache.store().set("foreign", b"x".to_vec(), None).await.unwrap();

        assert_eq!(cache.get_all_keys().await.unwrap(), vec!["app_k1", "app_k2"]);

        let all = cache.get_all().await.unwrap();
        assert_eq!(all["app_k1"], json!("one"));
        assert_eq!(all["app_k2"], json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_and_unlock() {
        let cache = CacheManager::new(InMemoryCache::new());

        assert!(cache.lock("job").await.unwrap());
        assert!(!cache.lock_with("job", 2).await.unwrap());
        assert!(cache.unlock("job").await.unwrap());
        assert!(!cache.unlock("job").await.unwrap());
        assert!(cache.lock_with("job", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_remember_computes_once() {
        let cache = CacheManager::new(InMemoryCache::new());

        let first: u32 = cache
            .remember("answer", None, &[], || async { Ok(42) })
            .await
            .unwrap();
        let second: u32 = cache
            .remember("answer", None, &[], || async { Ok(7) })
            .await
            .unwrap();

        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert!(cache.lock_with("answer", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_remember_releases_lock_on_error() {
        let cache = CacheManager::new(InMemoryCache::new());

        let result: CacheResult<u32> = cache
            .remember("broken", None, &[], || async {
                Err(CacheError::Other("backend down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(CacheError::Other(_))));
        assert!(cache.lock_with("broken", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_and_status() {
        let cache = CacheManager::new(InMemoryCache::new());
        cache.set("k", "v", None, &["t"]).await.unwrap();

        let status = cache.status().await.unwrap();
        assert_eq!(status["entries"], "2");

        cache.flush().await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
        assert!(!cache.exists_tag("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_json_serializer_is_readable_by_native() {
        let store = Arc::new(InMemoryCache::new());
        let json_config = CacheConfig::memory().with_serializer(crate::SerializerFormat::Json);
        let writer = CacheManager::from_shared(store.clone(), &json_config).unwrap();
        let reader = CacheManager::from_shared(store, &CacheConfig::memory()).unwrap();

        writer.set("doc", &json!({"a": [1, 2]}), None, &[]).await.unwrap();
        assert_eq!(reader.get("doc").await.unwrap(), json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let cache = connect(&CacheConfig::memory()).await.unwrap();
        assert_eq!(cache.store().name(), "memory");
        assert_eq!(cache.tag_mode(), TagMode::KeyList);

        cache.set("k", "v", None, &[]).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), json!("v"));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = CacheConfig::memory().with_key_prefix("lock_me");
        assert!(matches!(
            connect(&config).await,
            Err(CacheError::Config(_))
        ));
    }
}
