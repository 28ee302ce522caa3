//! Incremental build state cache.
//!
//! Each compiler gets a durable, target-scoped store remembering, for every
//! compilation unit, the source state it was last processed from and the
//! output state it produced. The [`classify`] module drives a front-end over
//! that store, partitioning items into changed, unchanged, and obsolete sets.

#![warn(missing_docs)]

pub mod address;
pub mod cache;
pub mod classify;
pub mod codec;
pub mod error;
pub mod registry;
pub mod store;

pub use address::{AddressDescriptor, CompositeAddress, KeySet};
pub use cache::{CacheOptions, CompilerCache, TIMESTAMPS_FILE};
pub use classify::{
    classify, process_session, process_target, ChangeSet, CollectingConsumer, CompilerInstance,
    Item, ObsoleteItem, OutputConsumer, SessionReport, TargetReport,
};
pub use codec::{BincodeCodec, Codec, Codecs};
pub use error::{CacheError, SessionError};
pub use registry::CacheRegistry;
pub use store::{PersistentStore, StoredRecord};
