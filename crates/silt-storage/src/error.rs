//! Error types for the storage layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error kinds shared by every layer of the lake.
///
/// Each crate keeps its own error enum; `kind()` on any of them lands in
/// this set, which is what callers branch on and what the HTTP boundary maps
/// to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Requested entity absent.
    NotFound,
    /// Name or id collision.
    Exists,
    /// Branch tip advanced or snapshot mutation invalid.
    Conflict,
    /// Commit with no state-changing actions.
    EmptyTransaction,
    /// Corrupt commit blob.
    BadCommitObject,
    /// Context cancelled.
    Cancelled,
    /// Object-store or HTTP transport failure.
    Transport,
    /// Registry predicate failed.
    Constraint,
    /// Malformed request or argument.
    Invalid,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Exists => "exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::EmptyTransaction => "empty_transaction",
            ErrorKind::BadCommitObject => "bad_commit_object",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Transport => "transport",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The addressed blob does not exist.
    #[error("{uri}: item does not exist")]
    NotFound {
        /// URI of the missing blob.
        uri: String,
    },

    /// A conditional put found the target already present.
    #[error("{uri}: item already exists")]
    Exists {
        /// URI of the existing blob.
        uri: String,
    },

    /// Underlying I/O failure other than not-found.
    #[error("I/O error on {uri}: {source}")]
    Io {
        /// URI being accessed.
        uri: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// URI text could not be parsed.
    #[error("invalid storage URI: {0}")]
    InvalidUri(String),

    /// No backend is registered for the URI scheme.
    #[error("unsupported storage scheme: {0}")]
    UnsupportedScheme(String),

    /// A sort layout could not be parsed.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// An id string was not a valid k-sortable id.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },

    /// A value arrived out of pool-key order at a writer.
    #[error("out-of-order write: {reason}")]
    OutOfOrder {
        /// Description of the offending keys.
        reason: String,
    },

    /// A writer was used after close or abort.
    #[error("writer for object {id} is {state}")]
    WriterState {
        /// Object id of the writer.
        id: String,
        /// Current state of the writer.
        state: &'static str,
    },

    /// Operation cancelled by its context.
    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Wrap an I/O error for `uri`, folding `NotFound` and `AlreadyExists`
    /// into their dedicated variants.
    pub fn io(uri: impl fmt::Display, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound {
                uri: uri.to_string(),
            },
            std::io::ErrorKind::AlreadyExists => StorageError::Exists {
                uri: uri.to_string(),
            },
            _ => StorageError::Io {
                uri: uri.to_string(),
                source,
            },
        }
    }

    /// The contractual kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::Exists { .. } => ErrorKind::Exists,
            StorageError::Io { .. } => ErrorKind::Transport,
            StorageError::InvalidUri(_)
            | StorageError::UnsupportedScheme(_)
            | StorageError::InvalidId(_)
            | StorageError::InvalidLayout(_)
            | StorageError::OutOfOrder { .. } => ErrorKind::Invalid,
            StorageError::Serialization { .. } | StorageError::WriterState { .. } => {
                ErrorKind::Internal
            }
            StorageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization {
            reason: err.to_string(),
        }
    }
}
