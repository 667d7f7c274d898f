//! Unified cache facade over interchangeable backends.
//!
//! Application code talks to one [`CacheManager`] whatever store sits behind
//! it. The manager adds what the native clients lack uniformly: key
//! prefixing and hashing, tag-based invalidation, serialization format
//! selection and a spin-wait lock against dog-piling.
//!
//! # Features
//!
//! - `redis` - Enable Redis cache support (enabled by default)
//! - `memcached` - Enable Memcached cache support (requires explicit opt-in)
//! - **In-memory and filesystem stores** - always available
//! - **Tag-based invalidation** - key-list or versioning strategy
//!
//! # Examples
//!
//! ## Basic usage
//!
//! ```
//! use stowage_cache::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), CacheError> {
//! let cache = CacheManager::new(InMemoryCache::new());
//!
//! cache.set("user:1", "alice", Some(Duration::from_secs(60)), &[]).await?;
//! assert_eq!(cache.get("user:1").await?, "alice");
//!
//! // Misses are errors of their own kind
//! assert!(cache.get("user:2").await.unwrap_err().is_missing());
//! # Ok(())
//! # }
//! ```
//!
//! ## Tag-based Invalidation
//!
//! ```
//! use stowage_cache::*;
//!
//! # async fn example() -> Result<(), CacheError> {
//! let cache = CacheManager::new(InMemoryCache::new());
//!
//! cache.set("user:123", r#"{"name":"Alice"}"#, None, &["users", "active-users"]).await?;
//!
//! // Invalidate all entries with the "users" tag
//! cache.remove_tag("users").await?;
//! assert!(!cache.exists("user:123").await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configured backend
//!
//! ```no_run
//! use stowage_cache::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let config = CacheConfig::redis("redis://localhost:6379")?
//!         .with_key_prefix("shop")
//!         .with_tag_mode(TagMode::Versioning);
//!     let cache = connect(&config).await?;
//!
//!     let hits = cache.increment("hits", 1, None, true).await?;
//!     println!("hits: {}", hits);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod file_cache;
pub mod invalidation;
pub mod key;
pub mod lock;
pub mod manager;
pub mod memory_cache;
pub mod serializer;
pub mod traits;
pub mod versioning;

#[cfg(feature = "redis")]
pub mod redis_cache;

#[cfg(feature = "memcached")]
pub mod memcached_cache;

pub use config::{CacheBackend, CacheConfig, TagMode};
pub use error::{CacheError, CacheResult};
pub use file_cache::FileCache;
pub use invalidation::{KeyListIndex, TagIndex, TagSnapshot, TagValue};
pub use key::{HashMode, KeyCodec, LOCK_PREFIX, TAG_PREFIX};
pub use lock::{DEFAULT_MAX_ITERATIONS, LockManager};
pub use manager::{CacheManager, SharedCacheManager, connect};
pub use memory_cache::InMemoryCache;
pub use serializer::{DecodeMode, Serializer, SerializerFormat, from_value, to_value};
pub use traits::{CacheStore, DynStore, StoreStatus};
pub use versioning::{VersionedEntry, VersionedIndex};

#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

#[cfg(feature = "memcached")]
pub use memcached_cache::MemcachedCache;

/// Prelude for common imports.
///
/// ```
/// use stowage_cache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{CacheBackend, CacheConfig, TagMode};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::key::HashMode;
    pub use crate::manager::{CacheManager, SharedCacheManager, connect};
    pub use crate::memory_cache::InMemoryCache;
    pub use crate::serializer::SerializerFormat;
    pub use crate::traits::CacheStore;

    #[cfg(feature = "redis")]
    pub use crate::redis_cache::RedisCache;

    #[cfg(feature = "memcached")]
    pub use crate::memcached_cache::MemcachedCache;
}
