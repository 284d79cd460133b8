//! Error types for commit, snapshot and registry operations.

use silt_storage::{ErrorKind, StorageError};
use thiserror::Error;

/// Result type alias for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors produced by the commit store, snapshots, patches and registries.
#[derive(Debug, Error)]
pub enum MetaError {
    /// An underlying storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The named entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The named entity already exists.
    #[error("{0} already exists")]
    Exists(String),

    /// An action cannot be applied to the snapshot it targets.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// A concurrent commit changed what this commit depends on.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A commit with no state-changing actions.
    #[error("empty transaction")]
    EmptyTransaction,

    /// A commit blob that does not start with a commit header or is truncated.
    #[error("bad commit object: {0}")]
    BadCommitObject(String),

    /// A registry predicate failed; the entry changed underneath the caller.
    #[error("constraint failed: {0}")]
    Constraint(String),

    /// Malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl MetaError {
    /// The contractual kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::Storage(e) => e.kind(),
            MetaError::NotFound(_) => ErrorKind::NotFound,
            MetaError::Exists(_) => ErrorKind::Exists,
            MetaError::WriteConflict(_) | MetaError::Conflict(_) => ErrorKind::Conflict,
            MetaError::EmptyTransaction => ErrorKind::EmptyTransaction,
            MetaError::BadCommitObject(_) => ErrorKind::BadCommitObject,
            MetaError::Constraint(_) => ErrorKind::Constraint,
            MetaError::InvalidArgument(_) => ErrorKind::Invalid,
            MetaError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kind_passes_through() {
        let err: MetaError = StorageError::NotFound {
            uri: "mem://x/y".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "mem://x/y: item does not exist");
    }

    #[test]
    fn test_conflict_kinds() {
        assert_eq!(
            MetaError::WriteConflict("x".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(MetaError::Constraint("y".into()).kind(), ErrorKind::Constraint);
        assert_eq!(MetaError::EmptyTransaction.to_string(), "empty transaction");
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            MetaError::NotFound("branch \"dev\"".into()).to_string(),
            "branch \"dev\" not found"
        );
        assert_eq!(
            MetaError::BadCommitObject("first action is Add".into()).to_string(),
            "bad commit object: first action is Add"
        );
    }
}
