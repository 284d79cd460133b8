//! Error type for the management layer.

use silt_lake::LakeError;
use silt_storage::ErrorKind;
use thiserror::Error;

/// Result type alias for management operations.
pub type MgmtResult<T> = Result<T, MgmtError>;

/// Errors from configuration loading and lake maintenance.
#[derive(Debug, Error)]
pub enum MgmtError {
    /// Lake operation failed.
    #[error(transparent)]
    Lake(#[from] LakeError),

    /// Config or input file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file rejected.
    #[error("config error: {0}")]
    Config(String),
}

impl MgmtError {
    /// The contractual kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MgmtError::Lake(e) => e.kind(),
            MgmtError::Io(_) => ErrorKind::Transport,
            MgmtError::Config(_) => ErrorKind::Invalid,
        }
    }
}

impl From<toml::de::Error> for MgmtError {
    fn from(err: toml::de::Error) -> Self {
        MgmtError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MgmtError {
    fn from(err: serde_json::Error) -> Self {
        MgmtError::Config(err.to_string())
    }
}
