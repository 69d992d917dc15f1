use std::io;

use rtx_store::StoreError;
use rtx_types::{Path, ResourceId, TaskId, TypeError};

/// Errors produced by the transaction engine.
#[derive(Debug, thiserror::Error)]
pub enum TransactError {
    /// An operation touched a path or id that was not declared when the
    /// transaction was built. Always a caller bug.
    #[error("scope violation: {0}")]
    ScopeViolation(String),

    /// The target path or resource is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path or resource id is already occupied.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Another transaction holds a lock on the declared scope. Retry the
    /// whole transaction after backing off.
    #[error("lock conflict on {0}")]
    Conflict(String),

    /// A structurally present resource has no contents.
    #[error("resource {0} is present but has no contents")]
    NullResource(ResourceId),

    /// The task does not exist on its resource.
    #[error("no such task: {0}")]
    NoSuchTask(TaskId),

    /// Use of a transaction or journal entry in the wrong state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A malformed request, such as a wildcard where a concrete path is
    /// required or an id owned by another node.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecoverable internal failure: interrupted admission, corrupt
    /// journal, poisoned lock.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransactError {
    /// True only for lock conflicts, which succeed on retry once the other
    /// transaction finishes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub(crate) fn path_not_found(path: &Path) -> Self {
        Self::NotFound(format!("no resource at path {path}"))
    }

    pub(crate) fn resource_not_found(id: &ResourceId) -> Self {
        Self::NotFound(format!("resource {id}"))
    }
}

/// Convenience alias used throughout the transact crate.
pub type TransactResult<T> = std::result::Result<T, TransactError>;
