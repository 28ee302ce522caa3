//! Per-file source stamps.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Snapshot of a source file's content used as a `SourceState`.
///
/// The length is kept alongside the hash so that truncations are visible
/// in debug output without recomputing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStamp {
    /// XXH3-128 hash of the file content.
    pub hash: ContentHash,
    /// File length in bytes.
    pub len: u64,
}

impl FileStamp {
    /// Builds a stamp from in-memory content.
    pub fn from_content(content: &[u8]) -> Self {
        Self {
            hash: ContentHash::from_bytes(content),
            len: content.len() as u64,
        }
    }

    /// Reads a file and stamps its current content.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read(path)?;
        Ok(Self::from_content(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_same_stamp() {
        assert_eq!(
            FileStamp::from_content(b"class A {}"),
            FileStamp::from_content(b"class A {}")
        );
    }

    #[test]
    fn edited_content_differs() {
        let a = FileStamp::from_content(b"class A {}");
        let b = FileStamp::from_content(b"class A { int x; }");
        assert_ne!(a, b);
        assert_eq!(a.len, 10);
    }

    #[test]
    fn of_file_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.java");
        std::fs::write(&path, "class A {}").unwrap();
        assert_eq!(
            FileStamp::of_file(&path).unwrap(),
            FileStamp::from_content(b"class A {}")
        );
    }

    #[test]
    fn of_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStamp::of_file(&dir.path().join("missing.java")).is_err());
    }
}
