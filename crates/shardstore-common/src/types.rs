//! Core type definitions for shardstore
//!
//! This module defines the identifiers and small value types shared by the
//! storage engine and its callers: shard ids, collection and object names,
//! byte ranges and attribute namespaces.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one worker shard (0..N-1)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ShardId(usize);

impl ShardId {
    /// Create a shard id from its index
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Index of this shard within the runtime
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

/// Maximum length of a collection or object name in bytes
pub const MAX_NAME_LEN: usize = 1024;

/// Name of a collection
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct CollectionId(String);

impl CollectionId {
    /// Create a new collection id
    pub fn new(id: impl Into<String>) -> Result<Self, NameError> {
        let id = id.into();
        validate_name(&id)?;
        Ok(Self(id))
    }

    /// Get the collection id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes fed to the placement hash
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionId({:?})", self.0)
    }
}

/// Name of an object within a collection
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectId(String);

impl ObjectId {
    /// Create a new object id
    pub fn new(id: impl Into<String>) -> Result<Self, NameError> {
        let id = id.into();
        validate_name(&id)?;
        Ok(Self(id))
    }

    /// Get the object id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes fed to the placement hash
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:?})", self.0)
    }
}

fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    Ok(())
}

/// Errors that can occur when creating a collection or object id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name cannot exceed 1024 bytes")]
    TooLong,
}

/// A contiguous span of bytes within an object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte of the span
    pub offset: u64,
    /// Number of bytes in the span
    pub length: u64,
}

impl ByteRange {
    /// Create a new range
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, `None` if it would overflow
    #[must_use]
    pub const fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// Exclusive end offset
    ///
    /// Callers validate with [`ByteRange::checked_end`] first.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check if the range covers no bytes
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.offset, self.length)
    }
}

/// Attribute namespace
///
/// Each namespace has its own independent, sorted key space on every object.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum AttrNamespace {
    /// Extended attributes (small, frequently read)
    #[display("xattr")]
    Xattr,
    /// Object map entries (key/value metadata)
    #[display("omap")]
    Omap,
}

impl AttrNamespace {
    /// Number of namespaces
    pub const COUNT: usize = 2;

    /// All namespaces, in index order
    pub const ALL: [AttrNamespace; Self::COUNT] = [AttrNamespace::Xattr, AttrNamespace::Omap];

    /// Dense index used for per-namespace arrays
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Xattr => 0,
            Self::Omap => 1,
        }
    }
}
