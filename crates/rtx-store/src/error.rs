use rtx_types::{Path, ResourceId, TransactionId};

/// Errors from backing store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A resource with this id is already committed.
    #[error("resource already exists: {0}")]
    DuplicateResource(ResourceId),

    /// The requested resource was not found.
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// A pending change was staged against a path that is not concrete.
    #[error("cannot stage a change to wildcard path {0}")]
    WildcardPath(Path),

    /// A pending change conflicts with state staged earlier by the same
    /// transaction.
    #[error("inconsistent pending change in transaction {transaction}: {reason}")]
    InconsistentChange {
        transaction: TransactionId,
        reason: String,
    },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock protecting backend state was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
