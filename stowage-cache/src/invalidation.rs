//! Tag-based cache invalidation
//!
//! A [`TagIndex`] tracks which entries carry which tags and invalidates them
//! as a group. Two strategies are provided:
//!
//! - [`KeyListIndex`]: each tag record lists the storage keys it covers;
//!   invalidating the tag deletes those keys.
//! - [`VersionedIndex`](crate::versioning::VersionedIndex): each tag record
//!   holds a timestamp; invalidating bumps it and entries written under the
//!   old stamp are dropped on their next read.
//!
//! Indexes operate on storage names: keys and tags are already prepared by
//! the [`KeyCodec`](crate::KeyCodec).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::config::TagMode;
use crate::error::CacheResult;
use crate::serializer::{DecodeMode, Serializer};
use crate::traits::CacheStore;

/// Tag stamps recorded when an entry was written, keyed by storage tag.
pub type TagSnapshot = BTreeMap<String, i64>;

/// Value of a tag record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    /// Storage keys tagged with the tag, sorted ascending
    Members(Vec<String>),
    /// Current generation stamp, in microseconds since the Unix epoch
    Version(i64),
}

impl TagValue {
    /// Member keys, if this is a key-list record.
    pub fn members(&self) -> Option<&[String]> {
        match self {
            TagValue::Members(keys) => Some(keys),
            TagValue::Version(_) => None,
        }
    }

    /// Stamp, if this is a versioning record.
    pub fn version(&self) -> Option<i64> {
        match self {
            TagValue::Version(stamp) => Some(*stamp),
            TagValue::Members(_) => None,
        }
    }
}

/// Tag bookkeeping strategy used by the cache manager.
#[async_trait]
pub trait TagIndex: Send + Sync {
    /// Strategy implemented by this index.
    fn mode(&self) -> TagMode;

    /// Stamps to embed in an entry about to be written with `tags` (empty
    /// when the strategy does not use stamps).
    async fn snapshot(&self, store: &dyn CacheStore, tags: &[String]) -> CacheResult<TagSnapshot>;

    /// Record that `key`, already written, carries `tags`.
    ///
    /// Only called once the write succeeded, so a rejected `add` leaves tag
    /// records untouched.
    async fn attach(&self, store: &dyn CacheStore, key: &str, tags: &[String]) -> CacheResult<()>;

    /// Invalidate every entry carrying `tag`. Returns `false` if the tag
    /// record does not exist or cannot be read.
    async fn invalidate(&self, store: &dyn CacheStore, tag: &str) -> CacheResult<bool>;

    /// Current value of a tag record.
    async fn read(&self, store: &dyn CacheStore, tag: &str) -> CacheResult<Option<TagValue>>;

    /// Current values of several tag records; absent tags are left out.
    async fn read_many(
        &self,
        store: &dyn CacheStore,
        tags: &[String],
    ) -> CacheResult<HashMap<String, TagValue>> {
        let mut found = HashMap::with_capacity(tags.len());
        for tag in tags {
            if let Some(value) = self.read(store, tag).await? {
                found.insert(tag.clone(), value);
            }
        }
        Ok(found)
    }

    /// Wrap a value before it is written.
    fn wrap_entry(&self, value: Value, snapshot: TagSnapshot) -> CacheResult<Value>;

    /// Unwrap a value after it is read. Returns `None` when the entry is
    /// stale; stale entries are deleted.
    async fn unwrap_entry(
        &self,
        store: &dyn CacheStore,
        key: &str,
        value: Value,
    ) -> CacheResult<Option<Value>>;
}

/// Tag index storing, per tag, the list of storage keys it covers.
///
/// Tag records never expire. Attaching is read-then-write: two writers
/// tagging different keys with the same tag at the same time may lose one
/// member (last writer wins). Members whose entries expired on their own are
/// not pruned; deleting them on invalidation is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyListIndex {
    serializer: Serializer,
}

impl KeyListIndex {
    /// Create an index encoding its records with `serializer`.
    pub fn new(serializer: Serializer) -> Self {
        Self { serializer }
    }

    async fn load_members(
        &self,
        store: &dyn CacheStore,
        tag: &str,
    ) -> CacheResult<Option<Vec<String>>> {
        let Some(bytes) = store.get(tag).await? else {
            return Ok(None);
        };

        let members = self
            .serializer
            .decode(&bytes, DecodeMode::Strict)
            .ok()
            .and_then(|value| serde_json::from_value::<Vec<String>>(value).ok());

        if members.is_none() {
            warn!(tag = %tag, "Discarding undecodable tag record");
        }

        Ok(members)
    }

    async fn store_members(
        &self,
        store: &dyn CacheStore,
        tag: &str,
        members: &[String],
    ) -> CacheResult<()> {
        let record = Value::Array(members.iter().cloned().map(Value::String).collect());
        let bytes = self.serializer.encode_composite(&record)?;
        store.set(tag, bytes, None).await
    }
}

#[async_trait]
impl TagIndex for KeyListIndex {
    fn mode(&self) -> TagMode {
        TagMode::KeyList
    }

    async fn snapshot(
        &self,
        _store: &dyn CacheStore,
        _tags: &[String],
    ) -> CacheResult<TagSnapshot> {
        Ok(TagSnapshot::new())
    }

    async fn attach(&self, store: &dyn CacheStore, key: &str, tags: &[String]) -> CacheResult<()> {
        for tag in tags {
            let mut members = self.load_members(store, tag).await?.unwrap_or_default();
            if members.iter().any(|m| m == key) {
                continue;
            }

            members.push(key.to_string());
            self.store_members(store, tag, &members).await?;
            debug!(tag = %tag, key = %key, members = members.len(), "Attached key to tag");
        }

        Ok(())
    }

    async fn invalidate(&self, store: &dyn CacheStore, tag: &str) -> CacheResult<bool> {
        let Some(members) = self.load_members(store, tag).await? else {
            // An unreadable record names no members: drop it, nothing was invalidated.
            store.delete(tag).await?;
            return Ok(false);
        };

        let mut doomed: Vec<&str> = members.iter().map(String::as_str).collect();
        doomed.push(tag);
        store.delete_many(&doomed).await?;

        debug!(tag = %tag, members = members.len(), "Invalidated tag");
        Ok(true)
    }

    async fn read(&self, store: &dyn CacheStore, tag: &str) -> CacheResult<Option<TagValue>> {
        Ok(self.load_members(store, tag).await?.map(|mut members| {
            members.sort();
            TagValue::Members(members)
        }))
    }

    fn wrap_entry(&self, value: Value, _snapshot: TagSnapshot) -> CacheResult<Value> {
        Ok(value)
    }

    async fn unwrap_entry(
        &self,
        _store: &dyn CacheStore,
        _key: &str,
        value: Value,
    ) -> CacheResult<Option<Value>> {
        Ok(Some(value))
    }
}
