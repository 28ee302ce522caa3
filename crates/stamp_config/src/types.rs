//! Configuration types deserialized from `stamp.toml`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default cache directory, relative to the project root.
pub const DEFAULT_CACHE_DIR: &str = ".stamp-cache";

/// The top-level configuration parsed from `stamp.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StampConfig {
    /// Cache storage settings.
    #[serde(default)]
    pub cache: CacheSection,
    /// Per-compiler settings keyed by compiler id (e.g. "javac").
    #[serde(default)]
    pub compilers: BTreeMap<String, CompilerConfig>,
}

/// Settings shared by every compiler cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Root directory holding one subdirectory per compiler.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Rewrite the backing log on close when stale entries dominate it.
    #[serde(default = "default_true")]
    pub compact_on_close: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            compact_on_close: true,
        }
    }
}

/// Settings for a single compiler's cache.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompilerConfig {
    /// Cache version. A cache written under a different version is wiped
    /// when opened.
    #[serde(default)]
    pub version: u32,
}

impl StampConfig {
    /// Returns the configured cache version for a compiler, `0` if unset.
    pub fn compiler_version(&self, compiler_id: &str) -> u32 {
        self.compilers
            .get(compiler_id)
            .map(|c| c.version)
            .unwrap_or_default()
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_section() {
        let config = StampConfig::default();
        assert_eq!(config.cache.dir, PathBuf::from(DEFAULT_CACHE_DIR));
        assert!(config.cache.compact_on_close);
        assert!(config.compilers.is_empty());
    }

    #[test]
    fn unknown_compiler_version_is_zero() {
        let config = StampConfig::default();
        assert_eq!(config.compiler_version("javac"), 0);
    }
}
