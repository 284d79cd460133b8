//! Error types for the planner and the lake API.

use std::sync::Arc;

use silt_meta::MetaError;
use silt_storage::{ErrorKind, StorageError};
use thiserror::Error;

/// Result type alias for lake operations.
pub type LakeResult<T> = Result<T, LakeError>;

/// Errors surfaced by scans and lake operations.
#[derive(Debug, Error)]
pub enum LakeError {
    /// Commit store, snapshot or registry error.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Object store or data object error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Operation cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// Query source text that could not be understood.
    #[error("invalid query: {0}")]
    Query(String),

    /// Malformed argument.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The remote lake refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Any other transport failure talking to a remote lake.
    #[error("transport error: {0}")]
    Transport(String),

    /// An error reported by a remote lake.
    #[error("{message}")]
    Remote {
        /// Kind reported by the remote side.
        kind: ErrorKind,
        /// Message reported by the remote side.
        message: String,
    },

    /// An error already returned once by a scanner, returned again.
    #[error(transparent)]
    Shared(Arc<LakeError>),
}

impl LakeError {
    /// The contractual kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LakeError::Meta(e) => e.kind(),
            LakeError::Storage(e) => e.kind(),
            LakeError::Cancelled => ErrorKind::Cancelled,
            LakeError::Query(_) | LakeError::Invalid(_) => ErrorKind::Invalid,
            LakeError::ConnectionRefused(_) | LakeError::Transport(_) => ErrorKind::Transport,
            LakeError::Remote { kind, .. } => *kind,
            LakeError::Shared(e) => e.kind(),
        }
    }

    /// True for the refused-connection case the monitor backs off on.
    pub fn is_connection_refused(&self) -> bool {
        match self {
            LakeError::ConnectionRefused(_) => true,
            LakeError::Shared(e) => e.is_connection_refused(),
            _ => false,
        }
    }

    /// Shorthand for a not-found error naming `what`.
    pub fn not_found(what: impl Into<String>) -> Self {
        LakeError::Meta(MetaError::NotFound(what.into()))
    }

    /// Shorthand for a conflict error.
    pub fn conflict(what: impl Into<String>) -> Self {
        LakeError::Meta(MetaError::Conflict(what.into()))
    }
}

impl From<reqwest::Error> for LakeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            LakeError::ConnectionRefused(err.to_string())
        } else {
            LakeError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LakeError {
    fn from(err: serde_json::Error) -> Self {
        LakeError::Transport(format!("malformed response body: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(LakeError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(LakeError::not_found("pool \"x\"").kind(), ErrorKind::NotFound);
        assert_eq!(LakeError::conflict("tip moved").kind(), ErrorKind::Conflict);
        assert_eq!(
            LakeError::Meta(MetaError::EmptyTransaction).kind(),
            ErrorKind::EmptyTransaction
        );
        let remote = LakeError::Remote {
            kind: ErrorKind::Exists,
            message: "pool \"x\" already exists".into(),
        };
        assert_eq!(remote.kind(), ErrorKind::Exists);
        assert_eq!(remote.to_string(), "pool \"x\" already exists");
    }

    #[test]
    fn test_shared_keeps_kind() {
        let err = LakeError::Shared(Arc::new(LakeError::ConnectionRefused("x".into())));
        assert!(err.is_connection_refused());
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "connection refused: x");
    }
}
