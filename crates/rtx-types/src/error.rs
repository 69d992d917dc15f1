use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid identifier {0:?}")]
    InvalidId(String),

    #[error("invalid revision {0:?}")]
    InvalidRevision(String),

    #[error("invalid transaction id {0:?}")]
    InvalidTransactionId(String),
}
