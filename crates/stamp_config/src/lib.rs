//! Parsing and validation of `stamp.toml` cache configuration files.
//!
//! This crate reads the cache configuration and produces a strongly-typed
//! [`StampConfig`] describing where compiler caches live and which cache
//! version each compiler currently expects.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, CONFIG_FILE};
pub use types::*;
