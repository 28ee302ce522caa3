//! Per-compiler cache facade.
//!
//! A `CompilerCache` owns the persistent store for one compiler and applies
//! the recovery policy: a structurally corrupted store is deleted and
//! recreated empty when the cache is created, and a store written under a
//! different cache version is wiped. Once created, I/O errors from reads
//! and writes propagate to the caller unchanged.

use std::path::{Path, PathBuf};

use crate::codec::Codecs;
use crate::error::CacheError;
use crate::store::{delete_all_files, PersistentStore, StoredRecord};

/// File name of the backing store inside a compiler's cache directory.
pub const TIMESTAMPS_FILE: &str = "timestamps";

/// Knobs applied when a compiler cache is created.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Expected cache version. A store stamped with another version is wiped.
    pub version: u32,
    /// Compact the backing log on close when stale entries dominate it.
    pub compact_on_close: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            version: 0,
            compact_on_close: true,
        }
    }
}

/// Incremental build state cache for a single compiler.
///
/// Records are scoped by target: the same key may be stored independently
/// under several targets. A session owns the cache exclusively from
/// [`CompilerCache::create`] to [`CompilerCache::close`].
pub struct CompilerCache<K, S, O> {
    compiler_id: String,
    path: PathBuf,
    codecs: Codecs<K, S, O>,
    options: CacheOptions,
    /// `None` once the cache has been closed.
    store: Option<PersistentStore<K, S, O>>,
}

impl<K, S, O> CompilerCache<K, S, O> {
    /// Opens or creates the cache for `compiler_id` under `cache_dir`.
    pub fn create(
        compiler_id: &str,
        cache_dir: &Path,
        codecs: Codecs<K, S, O>,
    ) -> Result<Self, CacheError> {
        Self::create_with(compiler_id, cache_dir, codecs, CacheOptions::default())
    }

    /// Opens or creates the cache with explicit options.
    ///
    /// The backing file is `<cache_dir>/<compiler_id>/timestamps`. Corruption
    /// never reaches the caller: the damaged files are deleted and an empty
    /// store takes their place, so every item is reprocessed on the next pass.
    ///
    /// `compiler_id` must be a single non-empty path component.
    pub fn create_with(
        compiler_id: &str,
        cache_dir: &Path,
        codecs: Codecs<K, S, O>,
        options: CacheOptions,
    ) -> Result<Self, CacheError> {
        validate_compiler_id(compiler_id)?;
        let path = cache_dir.join(compiler_id).join(TIMESTAMPS_FILE);
        let store = open_store(&path, &codecs, &options)?;
        let stored_version = store.version();

        let mut cache = Self {
            compiler_id: compiler_id.to_string(),
            path,
            codecs,
            options,
            store: Some(store),
        };
        if stored_version != cache.options.version {
            tracing::warn!(
                compiler = %cache.compiler_id,
                stored_version,
                expected_version = cache.options.version,
                "cache version changed, wiping"
            );
            cache.wipe()?;
        }
        Ok(cache)
    }

    /// Returns the stored record for `key` under `target`.
    pub fn get_state(
        &self,
        target: i32,
        key: &K,
    ) -> Result<Option<StoredRecord<S, O>>, CacheError> {
        self.store()?.get(target, key)
    }

    /// Records the states for `key` under `target`, replacing any prior record.
    pub fn put_state(
        &mut self,
        target: i32,
        key: K,
        source_state: &S,
        output_state: &O,
    ) -> Result<(), CacheError> {
        self.store_mut()?.put(target, key, source_state, output_state)
    }

    /// Removes the record for `key` under `target`. Removing an absent record
    /// is a no-op.
    pub fn remove(&mut self, target: i32, key: &K) -> Result<(), CacheError> {
        self.store_mut()?.remove(target, key).map(|_| ())
    }

    /// Visits the keys stored under `target` until `visitor` returns `false`.
    ///
    /// Order is unspecified. Returns `false` if the visitor stopped early.
    pub fn process_sources(
        &self,
        target: i32,
        visitor: impl FnMut(&K) -> bool,
    ) -> Result<bool, CacheError> {
        Ok(self.store()?.for_each_key_in_target(target, visitor))
    }

    /// Targets with at least one stored record, in ascending order.
    pub fn targets(&self) -> Result<Vec<i32>, CacheError> {
        Ok(self.store()?.targets())
    }

    /// Number of stored records across all targets.
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.store()?.len())
    }

    /// Forces written records to durable storage.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        self.store_mut()?.flush()
    }

    /// Deletes every record and starts over with an empty store.
    ///
    /// Callers must ensure no other operation is in flight. A closed cache is
    /// reopened by a wipe.
    pub fn wipe(&mut self) -> Result<(), CacheError> {
        if let Some(mut store) = self.store.take() {
            store.set_compact_on_close(false);
            store.close();
        }
        delete_all_files(&self.path)?;
        let store = open_store(&self.path, &self.codecs, &self.options)?;
        tracing::debug!(compiler = %self.compiler_id, "wiped compiler cache");
        self.store = Some(store);
        Ok(())
    }

    /// Releases the backing store. Safe to call more than once; errors are
    /// logged rather than returned.
    pub fn close(&mut self) {
        if let Some(store) = self.store.take() {
            store.close();
            tracing::debug!(compiler = %self.compiler_id, "closed compiler cache");
        }
    }

    /// Returns `true` once [`CompilerCache::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    /// The compiler this cache belongs to.
    pub fn compiler_id(&self) -> &str {
        &self.compiler_id
    }

    /// Path of the backing store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The codecs this cache was created with.
    pub fn codecs(&self) -> &Codecs<K, S, O> {
        &self.codecs
    }

    fn store(&self) -> Result<&PersistentStore<K, S, O>, CacheError> {
        self.store.as_ref().ok_or_else(|| CacheError::Closed {
            compiler_id: self.compiler_id.clone(),
        })
    }

    fn store_mut(&mut self) -> Result<&mut PersistentStore<K, S, O>, CacheError> {
        self.store.as_mut().ok_or_else(|| CacheError::Closed {
            compiler_id: self.compiler_id.clone(),
        })
    }
}

impl<K, S, O> Drop for CompilerCache<K, S, O> {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_compiler_id(compiler_id: &str) -> Result<(), CacheError> {
    let invalid = compiler_id.trim().is_empty()
        || compiler_id == "."
        || compiler_id == ".."
        || compiler_id.contains(['/', '\\']);
    if invalid {
        return Err(CacheError::InvalidCompilerId(compiler_id.to_string()));
    }
    Ok(())
}

/// Opens the store, recreating it from scratch if it is corrupted.
fn open_store<K, S, O>(
    path: &Path,
    codecs: &Codecs<K, S, O>,
    options: &CacheOptions,
) -> Result<PersistentStore<K, S, O>, CacheError> {
    let mut store = match PersistentStore::open(path, codecs.clone(), options.version) {
        Ok(store) => store,
        Err(err) if err.is_corruption() => {
            tracing::warn!(path = %path.display(), %err, "cache store corrupted, recreating");
            delete_all_files(path)?;
            PersistentStore::open(path, codecs.clone(), options.version)?
        }
        Err(err) => return Err(err),
    };
    store.set_compact_on_close(options.compact_on_close);
    Ok(store)
}
