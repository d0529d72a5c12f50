use crate::lease::LeaseId;
use thiserror::Error;

/// Errors reported by a [`LeaseService`](crate::service::LeaseService) backend.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("lease {0:?} not found")]
    NotFound(String),

    #[error("lease {0:?} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("lease service unavailable: {0}")]
    Unavailable(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }

    /// True for errors caused by the caller's context rather than the service.
    pub fn is_context_error(&self) -> bool {
        matches!(self, ServiceError::Cancelled | ServiceError::DeadlineExceeded)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create lease: {0}")]
    CreationFailed(#[source] ServiceError),

    #[error("failed to delete lease {id}: {source}")]
    DeletionFailed {
        id: LeaseId,
        #[source]
        source: ServiceError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// The backend error behind a creation or deletion failure, unchanged.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Error::CreationFailed(source) | Error::DeletionFailed { source, .. } => Some(source),
            Error::Config(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
