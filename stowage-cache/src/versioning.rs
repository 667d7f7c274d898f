//! Generation-stamp tag invalidation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::TagMode;
use crate::error::{CacheError, CacheResult};
use crate::invalidation::{TagIndex, TagSnapshot, TagValue};
use crate::traits::CacheStore;

/// Stored form of an entry written in versioning mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionedEntry {
    /// The cached value
    pub value: Value,
    /// Stamp of each tag when the entry was written
    pub tags: TagSnapshot,
}

/// Tag index storing a timestamp per tag.
///
/// Invalidation only bumps the stamp, so it costs one round trip regardless
/// of how many entries carry the tag. Stale entries are removed lazily when
/// they are next read.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedIndex;

impl VersionedIndex {
    /// Create a versioning index.
    pub fn new() -> Self {
        Self
    }
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn parse_stamp(tag: &str, bytes: &[u8]) -> Option<i64> {
    let stamp = std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok());

    if stamp.is_none() {
        warn!(tag = %tag, "Ignoring undecodable tag stamp");
    }

    stamp
}

async fn read_stamp(store: &dyn CacheStore, tag: &str) -> CacheResult<Option<i64>> {
    Ok(store
        .get(tag)
        .await?
        .and_then(|bytes| parse_stamp(tag, &bytes)))
}

#[async_trait]
impl TagIndex for VersionedIndex {
    fn mode(&self) -> TagMode {
        TagMode::Versioning
    }

    async fn snapshot(&self, store: &dyn CacheStore, tags: &[String]) -> CacheResult<TagSnapshot> {
        let mut snapshot = TagSnapshot::new();
        if tags.is_empty() {
            return Ok(snapshot);
        }

        let refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        let found = store.get_many(&refs).await?;

        for tag in tags {
            if let Some(stamp) = found.get(tag).and_then(|bytes| parse_stamp(tag, bytes)) {
                snapshot.insert(tag.clone(), stamp);
                continue;
            }

            let now = now_micros();
            let stamp = if store.add(tag, now.to_string().into_bytes(), None).await? {
                debug!(tag = %tag, stamp = now, "Created tag stamp");
                now
            } else {
                // Lost the creation race: record the winner's stamp.
                match read_stamp(store, tag).await? {
                    Some(stamp) => stamp,
                    None => {
                        store.set(tag, now.to_string().into_bytes(), None).await?;
                        now
                    }
                }
            };
            snapshot.insert(tag.clone(), stamp);
        }

        Ok(snapshot)
    }

    // Entries carry their stamps; there is nothing to record per key.
    async fn attach(
        &self,
        _store: &dyn CacheStore,
        _key: &str,
        _tags: &[String],
    ) -> CacheResult<()> {
        Ok(())
    }

    async fn invalidate(&self, store: &dyn CacheStore, tag: &str) -> CacheResult<bool> {
        let Some(current) = read_stamp(store, tag).await? else {
            return Ok(false);
        };

        let next = now_micros().max(current.saturating_add(1));
        let replaced = store.replace(tag, next.to_string().into_bytes(), None).await?;

        if replaced {
            debug!(tag = %tag, from = current, to = next, "Bumped tag stamp");
        }

        Ok(replaced)
    }

    async fn read(&self, store: &dyn CacheStore, tag: &str) -> CacheResult<Option<TagValue>> {
        Ok(read_stamp(store, tag).await?.map(TagValue::Version))
    }

    async fn read_many(
        &self,
        store: &dyn CacheStore,
        tags: &[String],
    ) -> CacheResult<HashMap<String, TagValue>> {
        let refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        let found = store.get_many(&refs).await?;

        Ok(found
            .into_iter()
            .filter_map(|(tag, bytes)| {
                parse_stamp(&tag, &bytes).map(|stamp| (tag, TagValue::Version(stamp)))
            })
            .collect())
    }

    fn wrap_entry(&self, value: Value, snapshot: TagSnapshot) -> CacheResult<Value> {
        serde_json::to_value(VersionedEntry {
            value,
            tags: snapshot,
        })
        .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    async fn unwrap_entry(
        &self,
        store: &dyn CacheStore,
        key: &str,
        value: Value,
    ) -> CacheResult<Option<Value>> {
        // Raw values such as counters are not enveloped.
        let entry: VersionedEntry = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(_) => return Ok(Some(value)),
        };

        if entry.tags.is_empty() {
            return Ok(Some(entry.value));
        }

        let refs: Vec<&str> = entry.tags.keys().map(String::as_str).collect();
        let current = store.get_many(&refs).await?;

        let stale = entry.tags.iter().find(|(tag, written)| {
            match current.get(*tag).and_then(|bytes| parse_stamp(tag, bytes)) {
                Some(stamp) => stamp > **written,
                None => true,
            }
        });

        if let Some((tag, _)) = stale {
            debug!(key = %key, tag = %tag, "Dropping stale versioned entry");
            store.delete(key).await?;
            return Ok(None);
        }

        Ok(Some(entry.value))
    }
}
