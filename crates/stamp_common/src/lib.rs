//! Shared foundational types for the stamp incremental build cache.
//!
//! This crate provides content hashing and per-file source stamps that
//! front-ends commonly use as their `SourceState`.

#![warn(missing_docs)]

pub mod hash;
pub mod stamp;

pub use hash::{checksum64, ContentHash};
pub use stamp::FileStamp;
