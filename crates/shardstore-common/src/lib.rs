//! shardstore common - shared types and utilities
//!
//! This crate provides the identifiers, error type, configuration and
//! placement hashing used by every shardstore component.

pub mod config;
pub mod error;
pub mod placement;
pub mod types;

pub use config::{Config, LoggingConfig, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use placement::{placement_hash, shard_for};
pub use types::*;
