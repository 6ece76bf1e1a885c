//! Engine error types.

use flotilla_registry::RegistryError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The leadership lease was lost during a pass.
    #[error("leadership lease lost")]
    LeaseLost,

    /// The pass was interrupted by shutdown or its deadline.
    #[error("reconcile pass cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_retryable(),
            Self::LeaseLost | Self::Cancelled => true,
        }
    }
}
