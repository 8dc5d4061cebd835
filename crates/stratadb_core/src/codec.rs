//! Pluggable (de)serialization and sanitization, resolved per partition.
//!
//! The coordination layer treats objects as opaque [`Value`]s and the
//! encode/decode pipeline as an external collaborator: a pure function
//! pair plus optional sanitization hooks, pluggable per logical
//! partition. The default pair is CBOR via `ciborium`. Partitions
//! without an override fall back to the default pair; the object and
//! metadata planes resolve independently.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use ciborium::Value;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors from the (de)serialization pipeline.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode failed: {message}")]
    Encode {
        /// Description of the failure.
        message: String,
    },

    /// Deserialization failed.
    #[error("decode failed: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },
}

/// Serializes a value for a (partition, key) slot.
pub type Serializer = Arc<dyn Fn(&str, &str, &Value) -> CodecResult<Vec<u8>> + Send + Sync>;

/// Deserializes the bytes stored for a (partition, key) slot.
pub type Deserializer = Arc<dyn Fn(&str, &str, &[u8]) -> CodecResult<Value> + Send + Sync>;

/// Rewrites a value on its way into or out of storage.
pub type Sanitizer = Arc<dyn Fn(&str, &str, Value) -> Value + Send + Sync>;

/// The capability set applied to one plane of one partition:
/// encode, decode, and the optional sanitizers around them.
///
/// The pre-sanitizer runs before encoding on writes; the
/// post-sanitizer runs after decoding on reads.
#[derive(Clone)]
pub struct Codec {
    serializer: Serializer,
    deserializer: Deserializer,
    pre_sanitizer: Option<Sanitizer>,
    post_sanitizer: Option<Sanitizer>,
}

impl Codec {
    /// The default codec: CBOR encoding, no sanitizers.
    pub fn cbor() -> Self {
        Self {
            serializer: Arc::new(|_, _, value| {
                let mut bytes = Vec::new();
                ciborium::ser::into_writer(value, &mut bytes).map_err(|e| CodecError::Encode {
                    message: e.to_string(),
                })?;
                Ok(bytes)
            }),
            deserializer: Arc::new(|_, _, bytes| {
                ciborium::de::from_reader(bytes).map_err(|e: ciborium::de::Error<_>| {
                    CodecError::Decode {
                        message: e.to_string(),
                    }
                })
            }),
            pre_sanitizer: None,
            post_sanitizer: None,
        }
    }

    /// Creates a codec from a custom serializer/deserializer pair.
    pub fn new(serializer: Serializer, deserializer: Deserializer) -> Self {
        Self {
            serializer,
            deserializer,
            pre_sanitizer: None,
            post_sanitizer: None,
        }
    }

    /// Sets the pre-sanitizer, applied before encoding on writes.
    #[must_use]
    pub fn with_pre_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.pre_sanitizer = Some(sanitizer);
        self
    }

    /// Sets the post-sanitizer, applied after decoding on reads.
    #[must_use]
    pub fn with_post_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.post_sanitizer = Some(sanitizer);
        self
    }

    /// Sanitizes and encodes a value for storage.
    ///
    /// Returns the sanitized value (what a reader would observe) along
    /// with its encoding.
    pub(crate) fn encode(
        &self,
        partition: &str,
        key: &str,
        value: Value,
    ) -> CodecResult<(Value, Vec<u8>)> {
        let value = match &self.pre_sanitizer {
            Some(sanitize) => sanitize(partition, key, value),
            None => value,
        };
        let bytes = (self.serializer)(partition, key, &value)?;
        Ok((value, bytes))
    }

    /// Decodes and sanitizes a stored value.
    pub(crate) fn decode(&self, partition: &str, key: &str, bytes: &[u8]) -> CodecResult<Value> {
        let value = (self.deserializer)(partition, key, bytes)?;
        Ok(match &self.post_sanitizer {
            Some(sanitize) => sanitize(partition, key, value),
            None => value,
        })
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("pre_sanitizer", &self.pre_sanitizer.is_some())
            .field("post_sanitizer", &self.post_sanitizer.is_some())
            .finish_non_exhaustive()
    }
}

/// The serializer table: a default codec pair plus per-partition
/// overrides, for the object and metadata planes independently.
///
/// Immutable once the database is constructed; resolved at transaction
/// time.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    object_default: Codec,
    metadata_default: Codec,
    object_overrides: HashMap<String, Codec>,
    metadata_overrides: HashMap<String, Codec>,
}

impl CodecRegistry {
    /// Creates a registry with CBOR defaults and no overrides.
    pub fn new() -> Self {
        Self {
            object_default: Codec::cbor(),
            metadata_default: Codec::cbor(),
            object_overrides: HashMap::new(),
            metadata_overrides: HashMap::new(),
        }
    }

    /// Replaces the default object codec.
    #[must_use]
    pub fn with_default_object_codec(mut self, codec: Codec) -> Self {
        self.object_default = codec;
        self
    }

    /// Replaces the default metadata codec.
    #[must_use]
    pub fn with_default_metadata_codec(mut self, codec: Codec) -> Self {
        self.metadata_default = codec;
        self
    }

    /// Overrides the object codec for one partition.
    #[must_use]
    pub fn with_object_codec(mut self, partition: impl Into<String>, codec: Codec) -> Self {
        self.object_overrides.insert(partition.into(), codec);
        self
    }

    /// Overrides the metadata codec for one partition.
    #[must_use]
    pub fn with_metadata_codec(mut self, partition: impl Into<String>, codec: Codec) -> Self {
        self.metadata_overrides.insert(partition.into(), codec);
        self
    }

    pub(crate) fn object_codec(&self, partition: &str) -> &Codec {
        self.object_overrides
            .get(partition)
            .unwrap_or(&self.object_default)
    }

    pub(crate) fn metadata_codec(&self, partition: &str) -> &Codec {
        self.metadata_overrides
            .get(partition)
            .unwrap_or(&self.metadata_default)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
