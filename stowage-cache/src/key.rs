//! Key and tag normalization.
//!
//! Every logical key is turned into a storage key of the form
//! `prefix + hash(key)`, and every tag into `TAG_PREFIX + hash(tag)`. The
//! mapping is pure: the same input under the same configuration always
//! yields the same storage name.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;

/// Namespace reserved for tag records.
pub const TAG_PREFIX: &str = "tag_";

/// Namespace reserved for lock records.
pub const LOCK_PREFIX: &str = "lock_";

/// Hashing applied to logical keys or tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Use the logical name verbatim
    #[default]
    None,
    /// Lowercase hex MD5 digest (32 chars)
    Md5,
    /// Lowercase hex SHA-1 digest (40 chars)
    Sha1,
}

impl HashMode {
    /// Apply the hash to `input`.
    pub fn apply(&self, input: &str) -> String {
        match self {
            HashMode::None => input.to_string(),
            HashMode::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            HashMode::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
        }
    }
}

impl FromStr for HashMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" | "" => Ok(HashMode::None),
            "md5" => Ok(HashMode::Md5),
            "sha" | "sha1" => Ok(HashMode::Sha1),
            other => Err(CacheError::Config(format!("Unknown hash mode: {}", other))),
        }
    }
}

impl fmt::Display for HashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashMode::None => "none",
            HashMode::Md5 => "md5",
            HashMode::Sha1 => "sha1",
        };
        write!(f, "{}", name)
    }
}

/// Converts logical keys and tags into storage names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
    key_hash: HashMode,
    tag_hash: HashMode,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(None, HashMode::Md5, HashMode::None)
    }
}

impl KeyCodec {
    /// Create a codec. A non-empty `prefix` is stored as `prefix_`.
    pub fn new(prefix: Option<&str>, key_hash: HashMode, tag_hash: HashMode) -> Self {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => format!("{}_", p),
            _ => String::new(),
        };

        Self {
            prefix,
            key_hash,
            tag_hash,
        }
    }

    /// The effective key prefix, separator included.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash mode used for keys.
    pub fn key_hash(&self) -> HashMode {
        self.key_hash
    }

    /// Hash mode used for tags.
    pub fn tag_hash(&self) -> HashMode {
        self.tag_hash
    }

    /// Storage key for `key`, or `None` if the key is empty.
    pub fn prepare_key(&self, key: &str) -> Option<String> {
        let prepared = self.prepare_key_with_prefix(key, &self.prefix)?;

        // Only reachable without prefix and hashing: keep the tag and lock
        // namespaces out of reach of plain keys.
        if prepared.starts_with(TAG_PREFIX) || prepared.starts_with(LOCK_PREFIX) {
            return None;
        }

        Some(prepared)
    }

    /// Storage key for `key` under an explicit prefix (used for lock records).
    pub fn prepare_key_with_prefix(&self, key: &str, prefix: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }

        Some(format!("{}{}", prefix, self.key_hash.apply(key)))
    }

    /// Storage name of the lock record guarding `key`.
    pub fn prepare_lock(&self, key: &str) -> Option<String> {
        self.prepare_key_with_prefix(key, LOCK_PREFIX)
    }

    /// Storage name for `tag`, or `None` if the tag is empty.
    pub fn prepare_tag(&self, tag: &str) -> Option<String> {
        if tag.is_empty() {
            return None;
        }

        Some(format!("{}{}", TAG_PREFIX, self.tag_hash.apply(tag)))
    }

    /// Storage names for a tag set: de-duplicated and sorted by logical name
    /// before hashing, empty tags dropped.
    pub fn prepare_tags<T: AsRef<str>>(&self, tags: &[T]) -> Vec<String> {
        let mut logical: Vec<&str> = tags.iter().map(|t| t.as_ref()).collect();
        logical.sort_unstable();
        logical.dedup();

        logical
            .into_iter()
            .filter_map(|tag| self.prepare_tag(tag))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_key_is_deterministic() {
        let codec = KeyCodec::default();
        assert_eq!(codec.prepare_key("key1"), codec.prepare_key("key1"));
        assert_eq!(
            codec.prepare_key("key1").unwrap(),
            "c2add694bf942dc77b376592d9c862cd"
        );
    }

    #[test]
    fn test_hash_mode_changes_storage_key() {
        let md5 = KeyCodec::new(None, HashMode::Md5, HashMode::None);
        let sha = KeyCodec::new(None, HashMode::Sha1, HashMode::None);
        let plain = KeyCodec::new(None, HashMode::None, HashMode::None);

        let a = md5.prepare_key("key5").unwrap();
        let b = sha.prepare_key("key5").unwrap();
        let c = plain.prepare_key("key5").unwrap();

        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 40);
        assert_eq!(c, "key5");
        assert_ne!(a, b);
    }

    #[test]
    fn test_prefix_is_applied_with_separator() {
        let codec = KeyCodec::new(Some("test"), HashMode::None, HashMode::None);
        assert_eq!(codec.prefix(), "test_");
        assert_eq!(codec.prepare_key("key6").unwrap(), "test_key6");
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let codec = KeyCodec::default();
        assert_eq!(codec.prepare_key(""), None);
        assert_eq!(codec.prepare_lock(""), None);
        assert_eq!(codec.prepare_tag(""), None);
    }

    #[test]
    fn test_plain_keys_cannot_reach_reserved_namespaces() {
        let codec = KeyCodec::new(None, HashMode::None, HashMode::None);
        assert_eq!(codec.prepare_key("tag_foo"), None);
        assert_eq!(codec.prepare_key("lock_foo"), None);
        assert_eq!(codec.prepare_key("foo").unwrap(), "foo");
    }

    #[test]
    fn test_lock_key_ignores_configured_prefix() {
        let codec = KeyCodec::new(Some("app"), HashMode::None, HashMode::None);
        assert_eq!(codec.prepare_lock("key1").unwrap(), "lock_key1");
    }

    #[test]
    fn test_prepare_tags_dedups_and_sorts() {
        let codec = KeyCodec::default();
        assert_eq!(
            codec.prepare_tags(&["b", "a", "a"]),
            codec.prepare_tags(&["a", "b"])
        );
        assert_eq!(codec.prepare_tags(&["foo", "bar"]), vec!["tag_bar", "tag_foo"]);
        assert!(codec.prepare_tags(&[""]).is_empty());
    }

    #[test]
    fn test_tag_hash_is_independent_of_key_hash() {
        let codec = KeyCodec::new(None, HashMode::None, HashMode::Sha1);
        assert_eq!(codec.prepare_key("foo").unwrap(), "foo");

        let tag = codec.prepare_tag("foo").unwrap();
        assert!(tag.starts_with(TAG_PREFIX));
        assert_eq!(tag.len(), TAG_PREFIX.len() + 40);
    }

    #[test]
    fn test_hash_mode_from_str() {
        assert_eq!("MD5".parse::<HashMode>().unwrap(), HashMode::Md5);
        assert_eq!("sha".parse::<HashMode>().unwrap(), HashMode::Sha1);
        assert_eq!("none".parse::<HashMode>().unwrap(), HashMode::None);
        assert!("crc32".parse::<HashMode>().is_err());
    }
}
