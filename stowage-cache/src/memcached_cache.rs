//! Memcached cache implementation.

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::{CacheStore, StoreStatus};
use async_trait::async_trait;
use memcache::{CommandError, MemcacheError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Relative expirations above this many seconds are read by the server as
/// absolute Unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Memcached cache store.
///
/// Note: The `memcache` crate doesn't have native async support,
/// so we wrap it with tokio's Mutex and use spawn_blocking for operations.
///
/// Requires the binary protocol (the `memcache` default): conditional
/// writes rely on its `KeyExists`/`KeyNotFound` status codes. Counters are
/// unsigned on the server, so decrements stop at zero.
#[derive(Clone)]
pub struct MemcachedCache {
    client: Arc<Mutex<memcache::Client>>,
}

impl MemcachedCache {
    /// Create a new Memcached cache instance over every server in
    /// `config.servers`; keys are distributed across them by the client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stowage_cache::*;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), CacheError> {
    ///     let config = CacheConfig::memcached("memcache://localhost:11211")?;
    ///     let cache = MemcachedCache::new(&config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: &CacheConfig) -> CacheResult<Self> {
        let servers = if config.servers.is_empty() {
            vec![crate::config::parse_memcached_url(&config.url)?]
        } else {
            config.servers.clone()
        };
        let count = servers.len();

        // Create client in blocking context
        let client = tokio::task::spawn_blocking(move || memcache::Client::connect(servers))
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to spawn task: {}", e)))?
            .map_err(|e| CacheError::Connection(format!("Failed to connect: {}", e)))?;

        info!(servers = count, "Connected to Memcached");

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Run a blocking client call on the blocking thread pool.
    async fn run<T, F>(&self, op: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> Result<T, MemcacheError> + Send + 'static,
    {
        let client = self.client.clone();

        let result = tokio::task::spawn_blocking(move || {
            let client = client.blocking_lock();
            op(&client)
        })
        .await
        .map_err(|e| CacheError::Other(format!("Task join error: {}", e)))?;

        Ok(result?)
    }
}

/// Convert a TTL to a Memcached expiration value (0 means never).
fn duration_to_expiration(ttl: Option<Duration>) -> u32 {
    let Some(ttl) = ttl else {
        return 0;
    };

    let secs = ttl.as_secs().max(1);
    let expiration = if secs > MAX_RELATIVE_EXPIRATION {
        chrono::Utc::now().timestamp().max(0) as u64 + secs
    } else {
        secs
    };

    u32::try_from(expiration).unwrap_or(u32::MAX)
}

/// Flatten per-server stats into `server:stat` entries.
fn flatten_stats(stats: Vec<(String, HashMap<String, String>)>) -> StoreStatus {
    stats
        .into_iter()
        .flat_map(|(server, values)| {
            values
                .into_iter()
                .map(move |(name, value)| (format!("{}:{}", server, name), value))
        })
        .collect()
}

#[async_trait]
impl CacheStore for MemcachedCache {
    fn name(&self) -> &'static str {
        "memcached"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.run(move |client| client.get::<Vec<u8>>(&key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let key = key.to_string();
        let expiration = duration_to_expiration(ttl);
        self.run(move |client| client.set(&key, value.as_slice(), expiration))
            .await
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        let key = key.to_string();
        let expiration = duration_to_expiration(ttl);
        self.run(move |client| match client.add(&key, value.as_slice(), expiration) {
            Ok(()) => Ok(true),
            Err(MemcacheError::CommandError(CommandError::KeyExists)) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let key = key.to_string();
        let expiration = duration_to_expiration(ttl);
        self.run(
            move |client| match client.replace(&key, value.as_slice(), expiration) {
                Ok(()) => Ok(true),
                Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => Ok(false),
                Err(e) => Err(e),
            },
        )
        .await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let key = key.to_string();
        self.run(move |client| client.delete(&key)).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        // Memcached doesn't have a native "exists" command
        Ok(self.get(key).await?.is_some())
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let key = key.to_string();
        let expiration = duration_to_expiration(ttl);
        self.run(move |client| client.touch(&key, expiration)).await
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let owned = key.to_string();
        let amount = delta.unsigned_abs();

        let result = self
            .run(move |client| {
                let value = if delta >= 0 {
                    client.increment(&owned, amount)
                } else {
                    client.decrement(&owned, amount)
                };

                match value {
                    Ok(v) => Ok(Some(v)),
                    Err(MemcacheError::CommandError(CommandError::KeyNotFound)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;

        let value = result.ok_or_else(|| CacheError::missing(key))?;
        i64::try_from(value)
            .map_err(|_| CacheError::Other(format!("Counter '{}' exceeds i64 range", key)))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.run(|client| client.flush()).await
    }

    async fn status(&self) -> CacheResult<StoreStatus> {
        let stats = self.run(|client| client.stats()).await?;
        Ok(flatten_stats(stats))
    }

    async fn get_many(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.run(move |client| {
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            client.gets::<Vec<u8>>(&refs)
        })
        .await
    }
}
