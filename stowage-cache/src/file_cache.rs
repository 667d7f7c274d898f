//! Filesystem cache store.
//!
//! One file per key under a root directory. Each file holds a header line
//! with the expiry time in Unix milliseconds (`0` for never) and the
//! hex-encoded key, followed by the raw value bytes.
//!
//! Files are named after the hex-encoded key. Keys whose hex form would not
//! fit in a file name are named after their SHA-1 digest instead; the key in
//! the header tells colliding names apart.

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};
use crate::traits::CacheStore;

const ENTRY_EXTENSION: &str = "cache";

/// Longest hex stem used verbatim; common filesystems cap names at 255 bytes.
const MAX_HEX_STEM: usize = 200;

/// Stem marker for digest-named files. Never produced by hex encoding.
const DIGEST_MARKER: char = '~';

/// Filesystem cache store.
///
/// Writes go through a temporary file and a rename, so readers never see a
/// partial entry. `add` publishes with a hard link, which fails atomically
/// when the key already exists. Read-modify-write operations are serialized
/// within the process only.
pub struct FileCache {
    root: PathBuf,
    write_lock: Mutex<()>,
}

struct FileEntry {
    key: String,
    expires_at: i64,
    value: Vec<u8>,
}

impl FileEntry {
    fn new(key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.to_string(),
            expires_at: expiry_millis(ttl),
            value,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at == 0 || self.expires_at > now_millis()
    }

    fn encode(&self) -> Vec<u8> {
        let header = format!("{} {}\n", self.expires_at, hex::encode(&self.key));
        let mut buf = Vec::with_capacity(header.len() + self.value.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    fn decode(bytes: Vec<u8>) -> Option<Self> {
        let newline = bytes.iter().position(|b| *b == b'\n')?;
        let header = std::str::from_utf8(&bytes[..newline]).ok()?;
        let (expires_at, key) = header.split_once(' ')?;
        let key = String::from_utf8(hex::decode(key).ok()?).ok()?;
        let value = bytes[newline + 1..].to_vec();
        Some(Self {
            key,
            expires_at: expires_at.parse().ok()?,
            value,
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) => {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
            now_millis().saturating_add(millis)
        }
        None => 0,
    }
}

impl FileCache {
    /// Open a cache rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            CacheError::Config(format!(
                "Failed to create cache directory {:?}: {}",
                root, e
            ))
        })?;

        info!(path = ?root, "Initialized file cache");

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut stem = hex::encode(key);
        if stem.len() > MAX_HEX_STEM {
            stem = format!("{}{}", DIGEST_MARKER, hex::encode(Sha1::digest(key.as_bytes())));
        }
        self.root.join(format!("{}.{}", stem, ENTRY_EXTENSION))
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(format!(".{:016x}.tmp", rand::random::<u64>()))
    }

    /// Read the live entry for `key`.
    async fn read_key(&self, key: &str) -> CacheResult<Option<FileEntry>> {
        let entry = self.read_entry(&self.entry_path(key)).await?;
        Ok(entry.filter(|e| e.key == key))
    }

    /// Read the live entry at `path`, removing it if it has expired.
    async fn read_entry(&self, path: &Path) -> CacheResult<Option<FileEntry>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(entry) = FileEntry::decode(bytes) else {
            debug!(path = ?path, "Discarding unreadable cache file");
            remove_quietly(path).await?;
            return Ok(None);
        };

        if !entry.is_live() {
            remove_quietly(path).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn write_temp(&self, entry: &FileEntry) -> CacheResult<PathBuf> {
        let temp = self.temp_path();
        fs::write(&temp, entry.encode()).await?;
        Ok(temp)
    }

    async fn write_entry(&self, path: &Path, entry: &FileEntry) -> CacheResult<()> {
        let temp = self.write_temp(entry).await?;
        if let Err(e) = fs::rename(&temp, path).await {
            remove_quietly(&temp).await?;
            return Err(e.into());
        }
        Ok(())
    }

    async fn entry_files(&self) -> CacheResult<Vec<PathBuf>> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                files.push(path);
            }
        }

        Ok(files)
    }
}

async fn remove_quietly(path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheStore for FileCache {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.read_key(key).await?.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.write_entry(&self.entry_path(key), &FileEntry::new(key, value, ttl))
            .await
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<bool> {
        let path = self.entry_path(key);
        let temp = self.write_temp(&FileEntry::new(key, value, ttl)).await?;

        let result = loop {
            match fs::hard_link(&temp, &path).await {
                Ok(()) => break Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    // An expired entry is removed by the read; try again. A live
                    // entry under a colliding digest name also occupies the slot.
                    if self.read_entry(&path).await?.is_some() {
                        break Ok(false);
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };

        remove_quietly(&temp).await?;
        result
    }

    async fn replace(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let _guard = self.write_lock.lock().await;
        if self.read_key(key).await?.is_none() {
            return Ok(false);
        }

        self.write_entry(&self.entry_path(key), &FileEntry::new(key, value, ttl))
            .await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        if self.read_key(key).await?.is_none() {
            return Ok(false);
        }
        remove_quietly(&self.entry_path(key)).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.read_key(key).await?.is_some())
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(entry) = self.read_key(key).await? else {
            return Ok(false);
        };

        self.write_entry(&self.entry_path(key), &FileEntry::new(key, entry.value, ttl))
            .await?;
        Ok(true)
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut entry = self
            .read_key(key)
            .await?
            .ok_or_else(|| CacheError::missing(key))?;

        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| CacheError::Other(format!("Value at '{}' is not an integer", key)))?;

        let new_value = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Other(format!("Counter '{}' overflowed", key)))?;

        entry.value = new_value.to_string().into_bytes();
        self.write_entry(&self.entry_path(key), &entry).await?;

        Ok(new_value)
    }

    async fn clear(&self) -> CacheResult<()> {
        for path in self.entry_files().await? {
            remove_quietly(&path).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();

        for path in self.entry_files().await? {
            if let Some(entry) = self.read_entry(&path).await? {
                keys.push(entry.key);
            }
        }

        Ok(keys)
    }
}
