//! Pluggable byte codecs for keys and states.
//!
//! The cache never interprets keys, source states, or output states. It only
//! needs to turn them into bytes and back, and to compare keys. A [`Codec`]
//! supplies those capabilities per value type and is injected into the store
//! when it is opened.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stamp_common::checksum64;

use crate::error::CacheError;

/// Encoding, decoding, equality and hashing for one value type.
///
/// `equal` and `hash` default to comparing and hashing the encoded bytes.
/// Override them when two distinct encodings denote the same value.
pub trait Codec<T>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CacheError>;

    /// Decodes a value from exactly `bytes`.
    fn decode(&self, bytes: &[u8]) -> Result<T, CacheError>;

    /// Returns `true` if `a` and `b` denote the same value.
    fn equal(&self, a: &T, b: &T) -> bool {
        let mut left = Vec::new();
        let mut right = Vec::new();
        match (self.encode(a, &mut left), self.encode(b, &mut right)) {
            (Ok(()), Ok(())) => left == right,
            _ => false,
        }
    }

    /// Hashes `value` consistently with [`Codec::equal`].
    fn hash(&self, value: &T) -> u64 {
        let mut bytes = Vec::new();
        match self.encode(value, &mut bytes) {
            Ok(()) => checksum64(&bytes),
            Err(_) => 0,
        }
    }
}

/// A codec for any serde type, using bincode's standard configuration.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Creates a new bincode codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T> Codec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CacheError> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(
            |e| CacheError::Codec {
                reason: e.to_string(),
            },
        )?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CacheError> {
        let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CacheError::Codec {
                reason: e.to_string(),
            })?;
        if read != bytes.len() {
            return Err(CacheError::Codec {
                reason: format!("{} trailing bytes after value", bytes.len() - read),
            });
        }
        Ok(value)
    }
}

/// The three codecs a store needs: key, source state and output state.
pub struct Codecs<K, S, O> {
    /// Codec for item keys; its `equal`/`hash` define key identity.
    pub key: Arc<dyn Codec<K>>,
    /// Codec for source states; its `equal` decides whether an item changed.
    pub source: Arc<dyn Codec<S>>,
    /// Codec for output states.
    pub output: Arc<dyn Codec<O>>,
}

impl<K, S, O> Codecs<K, S, O> {
    /// Bundles three codecs.
    pub fn new(
        key: impl Codec<K> + 'static,
        source: impl Codec<S> + 'static,
        output: impl Codec<O> + 'static,
    ) -> Self {
        Self {
            key: Arc::new(key),
            source: Arc::new(source),
            output: Arc::new(output),
        }
    }
}

impl<K, S, O> Codecs<K, S, O>
where
    K: Serialize + DeserializeOwned + 'static,
    S: Serialize + DeserializeOwned + 'static,
    O: Serialize + DeserializeOwned + 'static,
{
    /// Bincode codecs for all three types.
    pub fn bincode() -> Self {
        Self::new(BincodeCodec::new(), BincodeCodec::new(), BincodeCodec::new())
    }
}

impl<K, S, O> Clone for Codecs<K, S, O> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            source: Arc::clone(&self.source),
            output: Arc::clone(&self.output),
        }
    }
}

impl<K, S, O> fmt::Debug for Codecs<K, S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codecs").finish_non_exhaustive()
    }
}
