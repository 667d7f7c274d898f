//! Cache configuration types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::key::{HashMode, KeyCodec, LOCK_PREFIX, TAG_PREFIX};
use crate::serializer::{Serializer, SerializerFormat};

/// Prefix of every environment variable read by [`CacheConfig::from_env`].
pub const ENV_PREFIX: &str = "STOWAGE_CACHE_";

/// Cache backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process memory
    #[default]
    Memory,
    /// Redis backend
    Redis,
    /// Memcached backend
    Memcached,
    /// One file per key under a root directory
    File,
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheBackend::Memory => "Memory",
            CacheBackend::Redis => "Redis",
            CacheBackend::Memcached => "Memcached",
            CacheBackend::File => "File",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CacheBackend {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "apc" => Ok(CacheBackend::Memory),
            "redis" => Ok(CacheBackend::Redis),
            "memcached" | "memcache" => Ok(CacheBackend::Memcached),
            "file" | "filesystem" => Ok(CacheBackend::File),
            other => Err(CacheError::Config(format!("Unknown cache backend: {}", other))),
        }
    }
}

/// How tags are tracked and invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    /// Each tag stores the list of keys it covers; invalidation deletes them
    #[default]
    KeyList,
    /// Each tag stores a timestamp; invalidation bumps it and tagged
    /// entries become stale on their next read
    Versioning,
}

impl FromStr for TagMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "key_list" | "list" => Ok(TagMode::KeyList),
            "versioning" | "version" => Ok(TagMode::Versioning),
            other => Err(CacheError::Config(format!("Unknown tag mode: {}", other))),
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache backend type
    pub backend: CacheBackend,

    /// Connection URL (Redis)
    pub url: String,

    /// Server list (Memcached), each as `memcache://host:port`
    pub servers: Vec<String>,

    /// Root directory (File backend)
    pub path: Option<PathBuf>,

    /// Username for authenticated backends
    pub username: Option<String>,

    /// Password for authenticated backends
    pub password: Option<String>,

    /// Database number (Redis)
    pub database: Option<u8>,

    /// Key prefix for all cache keys
    pub key_prefix: Option<String>,

    /// Hashing applied to keys
    pub key_hash: HashMode,

    /// Hashing applied to tags
    pub tag_hash: HashMode,

    /// Encoding of composite values
    pub serializer: SerializerFormat,

    /// Tag invalidation strategy
    pub tag_mode: TagMode,

    /// Time to live of lock records
    #[serde(with = "secs")]
    pub lock_expire: Duration,

    /// Default TTL for cache entries
    #[serde(with = "opt_secs")]
    pub default_ttl: Option<Duration>,

    /// Connection timeout
    #[serde(with = "secs")]
    pub connection_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            url: String::new(),
            servers: Vec::new(),
            path: None,
            username: None,
            password: None,
            database: None,
            key_prefix: None,
            key_hash: HashMode::Md5,
            tag_hash: HashMode::None,
            serializer: SerializerFormat::Native,
            tag_mode: TagMode::KeyList,
            lock_expire: Duration::from_secs(30),
            default_ttl: None,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Create an in-memory cache configuration.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a new Redis cache configuration.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Examples
    ///
    /// ```
    /// use stowage_cache::CacheConfig;
    ///
    /// let config = CacheConfig::redis("redis://localhost:6379").unwrap();
    /// ```
    pub fn redis(url: impl Into<String>) -> CacheResult<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| CacheError::InvalidUrl(format!("{}: {}", url, e)))?;

        match parsed.scheme() {
            "redis" | "rediss" | "redis+unix" | "unix" => {}
            scheme => {
                return Err(CacheError::InvalidUrl(format!(
                    "Unsupported Redis scheme '{}' in {}",
                    scheme, url
                )));
            }
        }

        Ok(Self {
            backend: CacheBackend::Redis,
            url,
            ..Self::default()
        })
    }

    /// Create a new Memcached cache configuration.
    ///
    /// # Arguments
    ///
    /// * `url` - Memcached connection URL (e.g., "memcache://localhost:11211")
    ///
    /// # Examples
    ///
    /// ```
    /// use stowage_cache::CacheConfig;
    ///
    /// let config = CacheConfig::memcached("memcache://localhost:11211").unwrap();
    /// ```
    pub fn memcached(url: impl Into<String>) -> CacheResult<Self> {
        let server = parse_memcached_url(&url.into())?;

        Ok(Self {
            backend: CacheBackend::Memcached,
            url: server.clone(),
            servers: vec![server],
            ..Self::default()
        })
    }

    /// Create a filesystem cache configuration rooted at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: CacheBackend::File,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the key hash mode.
    pub fn with_key_hash(mut self, mode: HashMode) -> Self {
        self.key_hash = mode;
        self
    }

    /// Set the tag hash mode.
    pub fn with_tag_hash(mut self, mode: HashMode) -> Self {
        self.tag_hash = mode;
        self
    }

    /// Set the serializer for composite values.
    pub fn with_serializer(mut self, format: SerializerFormat) -> Self {
        self.serializer = format;
        self
    }

    /// Set the tag invalidation strategy.
    pub fn with_tag_mode(mut self, mode: TagMode) -> Self {
        self.tag_mode = mode;
        self
    }

    /// Set the lock record TTL.
    pub fn with_lock_expire(mut self, expire: Duration) -> Self {
        self.lock_expire = expire;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Replace the Memcached server list.
    pub fn with_servers<I, S>(mut self, servers: I) -> CacheResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.servers = servers
            .into_iter()
            .map(|s| parse_memcached_url(s.as_ref()))
            .collect::<CacheResult<_>>()?;
        Ok(self)
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the database number.
    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Key codec described by this configuration.
    pub fn codec(&self) -> KeyCodec {
        KeyCodec::new(self.key_prefix.as_deref(), self.key_hash, self.tag_hash)
    }

    /// Serializer described by this configuration.
    pub fn serializer(&self) -> Serializer {
        Serializer::new(self.serializer)
    }

    /// Check the configuration for values the cache cannot work with.
    pub fn validate(&self) -> CacheResult<()> {
        // Checked as applied to keys, separator included.
        let codec = self.codec();
        let prefix = codec.prefix();
        if prefix.starts_with(TAG_PREFIX) || prefix.starts_with(LOCK_PREFIX) {
            return Err(CacheError::Config(format!(
                "Key prefix '{}' collides with a reserved namespace ('{}', '{}')",
                prefix, TAG_PREFIX, LOCK_PREFIX
            )));
        }

        if self.lock_expire.is_zero() {
            return Err(CacheError::Config(
                "Lock expire must be greater than zero".to_string(),
            ));
        }

        match self.backend {
            CacheBackend::Memcached if self.servers.is_empty() => Err(CacheError::Config(
                "Memcached backend requires at least one server".to_string(),
            )),
            CacheBackend::Redis if self.url.is_empty() => Err(CacheError::Config(
                "Redis backend requires a connection URL".to_string(),
            )),
            CacheBackend::File if self.path.is_none() => Err(CacheError::Config(
                "File backend requires a root path".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Redis URL with credentials and database number applied.
    pub fn redis_url(&self) -> CacheResult<String> {
        let mut parsed = url::Url::parse(&self.url)
            .map_err(|e| CacheError::InvalidUrl(format!("{}: {}", self.url, e)))?;

        if let Some(username) = &self.username {
            parsed
                .set_username(username)
                .map_err(|_| CacheError::InvalidUrl(self.url.clone()))?;
        }

        if let Some(password) = &self.password {
            parsed
                .set_password(Some(password))
                .map_err(|_| CacheError::InvalidUrl(self.url.clone()))?;
        }

        if let Some(database) = self.database {
            parsed.set_path(&format!("/{}", database));
        }

        Ok(parsed.to_string())
    }

    /// Load configuration from `STOWAGE_CACHE_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are reported.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(backend) = var("BACKEND") {
            config.backend = backend.parse()?;
        }

        if let Some(url) = var("URL") {
            config.url = url;
        }

        if let Some(servers) = var("SERVERS") {
            config = config.with_servers(servers.split(',').map(str::trim))?;
        } else if config.backend == CacheBackend::Memcached && !config.url.is_empty() {
            config.servers = vec![parse_memcached_url(&config.url)?];
        }

        if let Some(path) = var("PATH") {
            config.path = Some(PathBuf::from(path));
        }

        config.username = var("USERNAME");
        config.password = var("PASSWORD");

        if let Some(database) = var("DATABASE") {
            config.database = Some(parse_number("DATABASE", &database)?);
        }

        config.key_prefix = var("PREFIX").filter(|p| !p.is_empty());

        if let Some(mode) = var("KEY_HASH") {
            config.key_hash = mode.parse()?;
        }

        if let Some(mode) = var("TAG_HASH") {
            config.tag_hash = mode.parse()?;
        }

        if let Some(format) = var("SERIALIZER") {
            config.serializer = format.parse()?;
        }

        if let Some(mode) = var("TAG_MODE") {
            config.tag_mode = mode.parse()?;
        }

        if let Some(secs) = var("LOCK_EXPIRE") {
            config.lock_expire = Duration::from_secs(parse_number("LOCK_EXPIRE", &secs)?);
        }

        if let Some(secs) = var("DEFAULT_TTL") {
            let secs: u64 = parse_number("DEFAULT_TTL", &secs)?;
            config.default_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> CacheResult<T> {
    raw.trim().parse().map_err(|_| {
        CacheError::Config(format!(
            "{}{} must be a number, got '{}'",
            ENV_PREFIX, name, raw
        ))
    })
}

/// Normalize a Memcached address to `memcache://host:port`.
///
/// Accepts either the full URL or a plain `host:port`.
pub(crate) fn parse_memcached_url(url: &str) -> CacheResult<String> {
    if url.starts_with("memcache://") {
        Ok(url.to_string())
    } else if url.contains(':') {
        Ok(format!("memcache://{}", url))
    } else {
        Err(CacheError::InvalidUrl(format!(
            "Invalid Memcached URL: {}. Expected format: 'memcache://host:port' or 'host:port'",
            url
        )))
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ttl) => serializer.serialize_some(&ttl.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.filter(|s| *s > 0).map(Duration::from_secs))
    }
}
