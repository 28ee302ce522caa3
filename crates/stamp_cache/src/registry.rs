//! Open compiler caches for one build, keyed by compiler id.
//!
//! The registry is an ordinary value owned by the build driver rather than
//! process-wide state, so every cache's open/wipe/close lifecycle can be
//! exercised in isolation.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use stamp_config::StampConfig;

use crate::cache::{CacheOptions, CompilerCache};
use crate::codec::Codecs;
use crate::error::CacheError;

/// Compiler caches rooted at one cache directory.
pub struct CacheRegistry<K, S, O> {
    root: PathBuf,
    versions: BTreeMap<String, u32>,
    compact_on_close: bool,
    caches: BTreeMap<String, CompilerCache<K, S, O>>,
}

impl<K, S, O> CacheRegistry<K, S, O> {
    /// Creates an empty registry storing caches under `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            versions: BTreeMap::new(),
            compact_on_close: true,
            caches: BTreeMap::new(),
        }
    }

    /// Creates an empty registry using the cache directory, compaction
    /// policy and compiler versions of a loaded configuration.
    pub fn from_config(config: &StampConfig) -> Self {
        Self {
            root: config.cache.dir.clone(),
            versions: config
                .compilers
                .iter()
                .map(|(id, c)| (id.clone(), c.version))
                .collect(),
            compact_on_close: config.cache.compact_on_close,
            caches: BTreeMap::new(),
        }
    }

    /// Root directory holding one subdirectory per compiler.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Options a cache for `compiler_id` is created with.
    pub fn options_for(&self, compiler_id: &str) -> CacheOptions {
        CacheOptions {
            version: self.versions.get(compiler_id).copied().unwrap_or_default(),
            compact_on_close: self.compact_on_close,
        }
    }

    /// Returns the open cache for `compiler_id`, creating it if needed.
    pub fn open(
        &mut self,
        compiler_id: &str,
        codecs: Codecs<K, S, O>,
    ) -> Result<&mut CompilerCache<K, S, O>, CacheError> {
        let options = self.options_for(compiler_id);
        match self.caches.entry(compiler_id.to_string()) {
            Entry::Occupied(entry) => {
                let cache = entry.into_mut();
                if cache.is_closed() {
                    *cache = CompilerCache::create_with(compiler_id, &self.root, codecs, options)?;
                }
                Ok(cache)
            }
            Entry::Vacant(entry) => {
                let cache = CompilerCache::create_with(compiler_id, &self.root, codecs, options)?;
                Ok(entry.insert(cache))
            }
        }
    }

    /// The open cache for `compiler_id`, if any.
    pub fn get(&self, compiler_id: &str) -> Option<&CompilerCache<K, S, O>> {
        self.caches.get(compiler_id)
    }

    /// Mutable access to the open cache for `compiler_id`, if any.
    pub fn get_mut(&mut self, compiler_id: &str) -> Option<&mut CompilerCache<K, S, O>> {
        self.caches.get_mut(compiler_id)
    }

    /// Wipes the cache for `compiler_id`.
    pub fn wipe(&mut self, compiler_id: &str) -> Result<(), CacheError> {
        self.caches
            .get_mut(compiler_id)
            .ok_or_else(|| CacheError::UnknownCompiler(compiler_id.to_string()))?
            .wipe()
    }

    /// Closes and forgets the cache for `compiler_id`. Returns `false` if it
    /// was not open.
    pub fn close(&mut self, compiler_id: &str) -> bool {
        match self.caches.remove(compiler_id) {
            Some(mut cache) => {
                cache.close();
                true
            }
            None => false,
        }
    }

    /// Closes every open cache.
    pub fn close_all(&mut self) {
        for (_, mut cache) in std::mem::take(&mut self.caches) {
            cache.close();
        }
    }

    /// Ids of the open caches, in ascending order.
    pub fn compiler_ids(&self) -> Vec<&str> {
        self.caches.keys().map(String::as_str).collect()
    }
}
