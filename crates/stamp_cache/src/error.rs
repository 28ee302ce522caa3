//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur during cache operations.
///
/// `Corrupted` is only produced while opening a store and is absorbed by
/// [`CompilerCache::create`](crate::CompilerCache::create); every other
/// variant propagates to the caller of the failing operation. Damage found
/// after a store is open surfaces as `Io` with
/// [`std::io::ErrorKind::InvalidData`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The backing store is structurally unreadable.
    #[error("corrupted cache store {path}: {reason}")]
    Corrupted {
        /// The backing file path.
        path: PathBuf,
        /// Description of the structural problem.
        reason: String,
    },

    /// A codec failed to encode or decode a key or state.
    #[error("codec error: {reason}")]
    Codec {
        /// Description of the codec failure.
        reason: String,
    },

    /// A store header could not be serialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// The cache was used after being closed.
    #[error("cache for compiler '{compiler_id}' is closed")]
    Closed {
        /// The compiler whose cache was closed.
        compiler_id: String,
    },

    /// No cache is open for the requested compiler.
    #[error("no cache is open for compiler '{0}'")]
    UnknownCompiler(String),

    /// A compiler id that cannot name a cache directory.
    #[error("invalid compiler id '{0}': must be a non-empty single path component")]
    InvalidCompilerId(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Damage detected while reading an already opened store.
    pub(crate) fn invalid_data(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, reason.into()),
        )
    }

    /// Returns `true` for structural corruption of the backing store.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

/// Errors raised while running the change-classification protocol.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The compiler front-end reported a failure for a whole target.
    #[error("front-end failed on target {target}: {reason}")]
    FrontEnd {
        /// The target being processed.
        target: i32,
        /// The front-end's message.
        reason: String,
    },

    /// The front-end returned a different number of outcomes than items given.
    #[error("front-end returned {actual} outcomes for {expected} items on target {target}")]
    OutcomeCount {
        /// The target being processed.
        target: i32,
        /// Number of items handed to the front-end.
        expected: usize,
        /// Number of outcomes it returned.
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = CacheError::io(
            "/tmp/cache/javac/timestamps",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("cache I/O error"));
        assert!(msg.contains("timestamps"));
        assert!(!err.is_corruption());
    }

    #[test]
    fn corrupted_display() {
        let err = CacheError::corrupted("timestamps", "truncated entry at offset 40");
        let msg = err.to_string();
        assert!(msg.contains("corrupted cache store"));
        assert!(msg.contains("offset 40"));
        assert!(err.is_corruption());
    }

    #[test]
    fn invalid_data_is_io_not_corruption() {
        let err = CacheError::invalid_data("timestamps", "checksum mismatch at offset 23");
        assert!(!err.is_corruption());
        match err {
            CacheError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidData);
                assert!(source.to_string().contains("offset 23"));
            }
            other => panic!("expected I/O error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_compiler_id_display() {
        let err = CacheError::InvalidCompilerId("../x".to_string());
        assert!(err.to_string().contains("'../x'"));
    }

    #[test]
    fn closed_display() {
        let err = CacheError::Closed {
            compiler_id: "javac".to_string(),
        };
        assert_eq!(err.to_string(), "cache for compiler 'javac' is closed");
    }

    #[test]
    fn session_error_wraps_cache_error() {
        let err: SessionError = CacheError::UnknownCompiler("jar".to_string()).into();
        assert_eq!(err.to_string(), "no cache is open for compiler 'jar'");
    }

    #[test]
    fn outcome_count_display() {
        let err = SessionError::OutcomeCount {
            target: 2,
            expected: 3,
            actual: 1,
        };
        assert!(err.to_string().contains("1 outcomes for 3 items on target 2"));
    }
}
