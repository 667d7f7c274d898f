//! Redis cache implementation.

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::{CacheStore, StoreStatus};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// INCRBY that refuses to create the counter.
const INCR_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
"#;

/// Keys fetched per SCAN round trip.
const SCAN_COUNT: usize = 1000;

/// Redis cache store.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Create a new Redis cache instance.
    ///
    /// Credentials and the database number from `config` are folded into
    /// the connection URL.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stowage_cache::*;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), CacheError> {
    ///     let config = CacheConfig::redis("redis://localhost:6379")?;
    ///     let cache = RedisCache::new(&config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: &CacheConfig) -> CacheResult<Self> {
        let url = config.redis_url()?;
        let client = Client::open(url.as_str()).map_err(|e| CacheError::Connection(e.to_string()))?;

        let connection = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                CacheError::Connection(format!(
                    "Timed out after {:?} connecting to Redis",
                    config.connection_timeout
                ))
            })?
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        info!(url = %config.url, "Connected to Redis");

        Ok(Self { connection })
    }

    /// Get the underlying connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn set_command(key: &str, value: Vec<u8>, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(ttl_millis(ttl));
    }
    cmd
}

/// Parse `INFO` output into `name -> value` pairs.
fn parse_info(info: &str) -> StoreStatus {
    info.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        let _: () = set_command(key, value, ttl).query_async(&mut conn).await?;
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = set_command(key, value, ttl)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = set_command(key, value, ttl)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let updated: bool = redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await?;
                Ok(updated)
            }
            None => {
                // PERSIST answers 0 for keys without a TTL, so existence is checked first.
                let exists: bool = conn.exists(key).await?;
                if exists {
                    let _: bool = conn.persist(key).await?;
                }
                Ok(exists)
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = redis::cmd("EVAL")
            .arg(INCR_EXISTING)
            .arg(1)
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        value.ok_or_else(|| CacheError::missing(key))
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(count = keys.len(), "Scanned Redis keys");
        Ok(keys)
    }

    async fn status(&self) -> CacheResult<StoreStatus> {
        let mut conn = self.connection.clone();
        let info: String = redis::cmd("INFO").query_async(&mut conn).await?;
        Ok(parse_info(&info))
    }

    async fn get_many(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.connection.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
            .collect())
    }

    async fn delete_many(&self, keys: &[&str]) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let removed: usize = conn.del(keys).await?;
        Ok(removed)
    }
}
