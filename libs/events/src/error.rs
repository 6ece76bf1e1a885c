//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The dotted event type name is not one this crate defines.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}
