use std::io;

use rtx_transact::TransactError;
use rtx_types::{ResourceId, TypeError};

/// Errors produced by the resource service and scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Transact(#[from] TransactError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("service is not running")]
    NotRunning,

    #[error("service is already running")]
    AlreadyRunning,

    /// The resource is already held in the resident cache.
    #[error("resource {0} is already resident")]
    AlreadyResident(ResourceId),

    /// The loader failed or produced the wrong resource.
    #[error("failed to load {resource_id}: {reason}")]
    Load {
        resource_id: ResourceId,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    /// True if retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transact(e) if e.is_retryable())
    }

    /// True for a missing path, resource or task.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Transact(TransactError::NotFound(_) | TransactError::NoSuchTask(_))
        )
    }
}

/// Convenience alias used throughout the service crate.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
