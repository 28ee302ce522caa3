//! Composite record addressing.
//!
//! A record is identified by the target it belongs to plus the item key.
//! Key identity is defined by the key [`Codec`], so the helpers here route
//! every comparison and hash through it instead of relying on `Eq`/`Hash`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::Codec;

/// Identity of one stored record: a target plus an item key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeAddress<K> {
    /// Target (module, build step) scoping the item.
    pub target: i32,
    /// Item key within the target.
    pub key: K,
}

impl<K> CompositeAddress<K> {
    /// Creates an address.
    pub fn new(target: i32, key: K) -> Self {
        Self { target, key }
    }
}

/// Equality and hashing of [`CompositeAddress`] values under a key codec.
///
/// Both components take part in equality as well as in the hash, so two
/// distinct keys under the same target never address the same record.
pub struct AddressDescriptor<K> {
    key: Arc<dyn Codec<K>>,
}

impl<K> AddressDescriptor<K> {
    /// Creates a descriptor using `key` for key identity.
    pub fn new(key: Arc<dyn Codec<K>>) -> Self {
        Self { key }
    }

    /// Returns `true` if both target and key match.
    pub fn equal(&self, a: &CompositeAddress<K>, b: &CompositeAddress<K>) -> bool {
        self.matches(a, b.target, &b.key)
    }

    /// Hash combining target and key hash.
    pub fn hash(&self, address: &CompositeAddress<K>) -> u64 {
        self.hash_parts(address.target, &address.key)
    }

    /// Like [`AddressDescriptor::equal`], for a borrowed target/key pair.
    pub fn matches(&self, address: &CompositeAddress<K>, target: i32, key: &K) -> bool {
        address.target == target && self.key.equal(&address.key, key)
    }

    /// Like [`AddressDescriptor::hash`], for a borrowed target/key pair.
    pub fn hash_parts(&self, target: i32, key: &K) -> u64 {
        self.key
            .hash(key)
            .wrapping_mul(31)
            .wrapping_add(target as u32 as u64)
    }
}

impl<K> Clone for AddressDescriptor<K> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
        }
    }
}

/// A set of keys whose membership is decided by a key codec.
pub struct KeySet<K> {
    codec: Arc<dyn Codec<K>>,
    buckets: HashMap<u64, Vec<K>>,
    len: usize,
}

impl<K> KeySet<K> {
    /// Creates an empty set.
    pub fn new(codec: Arc<dyn Codec<K>>) -> Self {
        Self {
            codec,
            buckets: HashMap::new(),
            len: 0,
        }
    }

    /// Inserts `key`, returning `false` if an equal key was already present.
    pub fn insert(&mut self, key: K) -> bool {
        let bucket = self.buckets.entry(self.codec.hash(&key)).or_default();
        if bucket.iter().any(|k| self.codec.equal(k, &key)) {
            return false;
        }
        bucket.push(key);
        self.len += 1;
        true
    }

    /// Returns `true` if an equal key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.buckets
            .get(&self.codec.hash(key))
            .is_some_and(|bucket| bucket.iter().any(|k| self.codec.equal(k, key)))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
