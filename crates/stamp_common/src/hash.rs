//! Content hashing for change detection and integrity checks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 128-bit content hash computed using XXH3.
///
/// Two inputs with the same `ContentHash` are assumed to have identical
/// content. Front-ends typically embed one in their source state so the
/// classifier can tell modified items from unchanged ones.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Computes a content hash from a byte slice using XXH3-128.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Returns the raw little-endian digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, ..] = self.0;
        write!(f, "ContentHash({a:02x}{b:02x}{c:02x}{d:02x}..)")
    }
}

/// Computes the 64-bit XXH3 checksum used to guard on-disk records.
pub fn checksum64(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_little_endian_xxh3_128() {
        let h = ContentHash::from_bytes(b"class A {}");
        assert_eq!(
            h.as_bytes(),
            &xxhash_rust::xxh3::xxh3_128(b"class A {}").to_le_bytes()
        );
    }

    #[test]
    fn hash_and_checksum_agree_on_identity() {
        let (a, b, c) = (&b"class A {}"[..], &b"class A {}"[..], &b"class A { }"[..]);
        assert_eq!(ContentHash::from_bytes(a), ContentHash::from_bytes(b));
        assert_eq!(checksum64(a), checksum64(b));
        assert_ne!(ContentHash::from_bytes(a), ContentHash::from_bytes(c));
        assert_ne!(checksum64(a), checksum64(c));
    }

    #[test]
    fn display_spells_out_digest() {
        let h = ContentHash::from_bytes(b"");
        let expected: String = h.as_bytes().iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(h.to_string(), expected);
    }

    #[test]
    fn debug_shows_display_prefix() {
        let h = ContentHash::from_bytes(b"out/A.class");
        let display = h.to_string();
        assert_eq!(format!("{h:?}"), format!("ContentHash({}..)", &display[..8]));
    }

    #[test]
    fn json_keeps_digest_bytes() {
        let h = ContentHash::from_bytes(b"stamp");
        let json = serde_json::to_string(&h).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_bytes(), h.as_bytes());
    }

    #[test]
    fn checksum_is_xxh3_64() {
        assert_eq!(checksum64(b"payload"), xxhash_rust::xxh3::xxh3_64(b"payload"));
    }

    #[test]
    fn checksum_detects_single_bit_flip() {
        let mut data = b"record payload".to_vec();
        let before = checksum64(&data);
        data[3] ^= 0x01;
        assert_ne!(before, checksum64(&data));
    }
}
