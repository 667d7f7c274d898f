//! Error types for cache operations.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
///
/// A cache miss is reported as [`CacheError::Missing`] so callers can tell it
/// apart from a backend fault without inspecting messages.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis-specific error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Memcached-specific error
    #[cfg(feature = "memcached")]
    #[error("Memcached error: {0}")]
    Memcached(#[from] memcache::MemcacheError),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Key, tag or counter is absent (or stale)
    #[error("Key not found: {0}")]
    Missing(String),

    /// The backend cannot perform this operation
    #[error("Unknown operation `{operation}` for {backend} store")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Generic error
    #[error("Cache error: {0}")]
    Other(String),
}

impl CacheError {
    /// Build an [`CacheError::Unsupported`] error.
    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    /// Build a [`CacheError::Missing`] error for a key or tag.
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    /// Check if this error is a plain cache miss.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }

    /// Check if the backend rejected the operation as unsupported.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            #[cfg(feature = "redis")]
            Self::Redis(e) => e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}
