//! Agent error types.

use flotilla_registry::RegistryError;
use thiserror::Error;

use crate::supervisor::SupervisorError;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// A scheduled unit's payload is missing from the registry.
    #[error("payload {0} not found")]
    MissingPayload(String),
}
