//! Store-level error types

use stratus_common::{StratusError, Transient};

/// Failures reported by a [`StoreAdapter`](crate::StoreAdapter)
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("precondition failed for '{0}'")]
    ConditionFailed(String),

    #[error("'{0}' already has a live lease")]
    Conflict(String),

    #[error("lease on '{0}' is not held by the caller")]
    NotHolder(String),

    #[error("receipt for message '{0}' is no longer valid")]
    LeaseExpired(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Contention outcomes (`NotFound`, `ConditionFailed`, `Conflict`) are
/// normally handled by the caller before reaching this conversion; when they
/// leak through they become `Internal` so they are never retried blindly.
impl From<StoreError> for StratusError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(path) => StratusError::KeyNotFound(path),
            StoreError::NotHolder(path) => StratusError::NotHolder { resource: path },
            StoreError::LeaseExpired(id) => StratusError::LeaseExpired { message_id: id },
            StoreError::QueueNotFound(name) => {
                StratusError::MessageNotFound(format!("queue '{}' does not exist", name))
            }
            StoreError::Unavailable(reason) => StratusError::StorageUnavailable(reason),
            other @ (StoreError::ConditionFailed(_) | StoreError::Conflict(_)) => {
                StratusError::Internal(other.to_string())
            }
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
