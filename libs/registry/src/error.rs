//! Registry error types.

use flotilla_id::IdError;
use flotilla_unit::UnitFileError;
use thiserror::Error;

use crate::kv::KvError;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry operation errors.
///
/// Only `Transport` is retryable; the logical outcomes are returned to the
/// caller unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A compare-and-swap or compare-and-delete did not match.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The store could not be reached or did not answer in time.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request was rejected before reaching the store.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Stored data does not match its content address.
    #[error("corrupt registry data: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RegistryError {
    /// Returns true for errors a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, RegistryError::AlreadyExists(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, RegistryError::PreconditionFailed(_))
    }
}

impl From<KvError> for RegistryError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound(key) => RegistryError::NotFound(key),
            KvError::AlreadyExists(key) => RegistryError::AlreadyExists(key),
            KvError::PreconditionFailed { key, reason } => {
                RegistryError::PreconditionFailed(format!("{key}: {reason}"))
            }
            e @ (KvError::IndexCleared { .. } | KvError::Unavailable(_)) => {
                RegistryError::Transport(e.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}

impl From<IdError> for RegistryError {
    fn from(err: IdError) -> Self {
        RegistryError::InvalidInput(err.to_string())
    }
}

impl From<UnitFileError> for RegistryError {
    fn from(err: UnitFileError) -> Self {
        RegistryError::InvalidInput(err.to_string())
    }
}
