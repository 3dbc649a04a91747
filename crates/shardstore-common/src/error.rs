//! Error types for shardstore
//!
//! This module defines the common error type returned by every store,
//! collection and object operation.

use crate::types::{AttrNamespace, NameError};
use thiserror::Error;

/// Common result type for shardstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for shardstore
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("object not found: {collection}/{oid}")]
    ObjectNotFound { collection: String, oid: String },

    #[error("object already exists: {collection}/{oid}")]
    ObjectAlreadyExists { collection: String, oid: String },

    #[error("attribute not found: {ns}/{key}")]
    AttrNotFound { ns: AttrNamespace, key: String },

    // Range errors
    #[error("range {offset}~{length} exceeds object size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    // Request errors
    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    // Runtime errors
    #[error("shard {0} is unavailable")]
    ShardUnavailable(usize),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    OutOfRange,
    Unsupported,
    InvalidArgument,
    Unavailable,
    Internal,
}

impl Error {
    /// Create an unsupported-operation error
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an object-not-found error
    pub fn object_not_found(collection: impl Into<String>, oid: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            collection: collection.into(),
            oid: oid.into(),
        }
    }

    /// Create an object-already-exists error
    pub fn object_exists(collection: impl Into<String>, oid: impl Into<String>) -> Self {
        Self::ObjectAlreadyExists {
            collection: collection.into(),
            oid: oid.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CollectionNotFound(_) | Self::ObjectNotFound { .. } | Self::AttrNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::CollectionAlreadyExists(_) | Self::ObjectAlreadyExists { .. } => {
                ErrorKind::AlreadyExists
            }
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidArgument(_) | Self::InvalidName(_) => ErrorKind::InvalidArgument,
            Self::ShardUnavailable(_) => ErrorKind::Unavailable,
            Self::Configuration(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this is an already-exists error
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}
