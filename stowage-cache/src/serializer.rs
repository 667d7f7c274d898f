//! Value encoding between application values and backend bytes.
//!
//! Scalars are written as plain text so that backends can operate on them
//! natively (`INCRBY` on a counter written by `set`, for instance). Lists
//! and maps go through the configured [`SerializerFormat`].
//!
//! Native payloads start with [`NATIVE_MARKER`], a byte that can neither open
//! a valid MessagePack document nor appear in UTF-8 text, so detection on
//! decode never confuses a native payload with a string or a JSON document.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, CacheResult};

/// Lead byte of every native-format payload.
pub const NATIVE_MARKER: u8 = 0xC1;

/// Encoding used for composite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerFormat {
    /// Marked MessagePack
    #[default]
    Native,
    /// JSON text
    Json,
}

impl FromStr for SerializerFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" | "msgpack" => Ok(SerializerFormat::Native),
            "json" => Ok(SerializerFormat::Json),
            other => Err(CacheError::Config(format!("Unknown serializer: {}", other))),
        }
    }
}

impl fmt::Display for SerializerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializerFormat::Native => write!(f, "native"),
            SerializerFormat::Json => write!(f, "json"),
        }
    }
}

/// How [`Serializer::decode`] treats bytes that are neither native nor JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Fail with [`CacheError::Deserialization`]
    Strict,
    /// Return the bytes as a string
    Lenient,
}

/// Encoder/decoder for cache values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Serializer {
    format: SerializerFormat,
}

impl Serializer {
    /// Create a serializer for the given composite format.
    pub fn new(format: SerializerFormat) -> Self {
        Self { format }
    }

    /// Format used for composite values.
    pub fn format(&self) -> SerializerFormat {
        self.format
    }

    /// Encode a value into backend bytes.
    pub fn encode(&self, value: &Value) -> CacheResult<Vec<u8>> {
        match value {
            // A string that would read back as JSON is quoted so it stays a string.
            Value::String(s) if Self::is_json(s.as_bytes()) => serde_json::to_vec(value)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            Value::String(s) => Ok(s.clone().into_bytes()),
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.to_string().into_bytes()),
            Value::Array(_) | Value::Object(_) => self.encode_composite(value),
        }
    }

    /// Encode with the configured format regardless of the value's shape.
    pub fn encode_composite(&self, value: &Value) -> CacheResult<Vec<u8>> {
        match self.format {
            SerializerFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
            }
            SerializerFormat::Native => {
                let body = rmp_serde::to_vec_named(value)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                let mut buf = Vec::with_capacity(body.len() + 1);
                buf.push(NATIVE_MARKER);
                buf.extend_from_slice(&body);
                Ok(buf)
            }
        }
    }

    /// Decode backend bytes, trying the native format first, then JSON.
    ///
    /// Decoding does not depend on the configured format, so entries written
    /// under either format stay readable after a configuration change.
    pub fn decode(&self, bytes: &[u8], mode: DecodeMode) -> CacheResult<Value> {
        if let Some(value) = Self::decode_native(bytes) {
            return Ok(value);
        }

        if let Some(value) = Self::decode_json(bytes) {
            return Ok(value);
        }

        match mode {
            DecodeMode::Strict => Err(CacheError::Deserialization(
                "Value is neither native-serialized nor JSON".to_string(),
            )),
            DecodeMode::Lenient => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        }
    }

    /// Whether `bytes` is a native-format payload.
    pub fn is_native(bytes: &[u8]) -> bool {
        Self::decode_native(bytes).is_some()
    }

    /// Whether `bytes` is a JSON document.
    pub fn is_json(bytes: &[u8]) -> bool {
        Self::decode_json(bytes).is_some()
    }

    fn decode_native(bytes: &[u8]) -> Option<Value> {
        let body = bytes.strip_prefix(&[NATIVE_MARKER])?;
        rmp_serde::from_slice(body).ok()
    }

    fn decode_json(bytes: &[u8]) -> Option<Value> {
        if bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(bytes).ok()
    }
}

/// Convert a typed value into the dynamic representation the cache stores.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> CacheResult<Value> {
    serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Convert a cached value back into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> CacheResult<T> {
    serde_json::from_value(value).map_err(|e| CacheError::Deserialization(e.to_string()))
}
