use thiserror::Error;

use crate::state_machine::{AttachmentKind, Estado};

/// Failures of `transition` and of attachment mutations.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition { from: Estado, to: Estado },

    #[error("state {0} requires a justification")]
    MissingJustification(Estado),

    /// Another writer committed first. Re-read and retry.
    #[error("remision {id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification { id: String, expected_version: u64 },

    #[error("remision not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TransitionError {
    /// Only a lost optimistic-concurrency race is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransitionError::ConcurrentModification { .. })
    }
}

impl From<RepositoryError> for TransitionError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => TransitionError::NotFound(id),
            RepositoryError::ConcurrentModification {
                id,
                expected_version,
            } => TransitionError::ConcurrentModification {
                id,
                expected_version,
            },
            RepositoryError::AlreadyExists(id) => {
                TransitionError::Validation(ValidationError::Invalid(format!(
                    "remision {id} already exists"
                )))
            }
            RepositoryError::Validation(err) => TransitionError::Validation(err),
            err @ (RepositoryError::Busy(_) | RepositoryError::Io(_) | RepositoryError::Corrupt(_)) => {
                TransitionError::Storage(err.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("remision not found: {0}")]
    NotFound(String),

    #[error("remision {id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification { id: String, expected_version: u64 },

    #[error("remision already exists: {0}")]
    AlreadyExists(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Another process holds the write lock.
    #[error("{0} is locked by another writer")]
    Busy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data is not valid: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} must not be negative")]
    Negative { field: &'static str },

    #[error("too many {field}: {count} (max {max})")]
    TooMany {
        field: &'static str,
        count: usize,
        max: usize,
    },

    #[error("fecha_maximo must not be earlier than fecha_remision")]
    DateOrder,

    #[error("{0} is required")]
    Required(&'static str),

    #[error("{kind} does not accept media type {media_type}")]
    MediaType {
        kind: AttachmentKind,
        media_type: String,
    },

    #[error("file is {size} bytes, limit is {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("{0}")]
    Invalid(String),
}
