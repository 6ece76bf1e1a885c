//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The identifier exceeds the maximum length.
    #[error("identifier too long: {len} > {max}")]
    TooLong { len: usize, max: usize },

    /// The identifier contains a character that cannot appear in a key segment.
    #[error("invalid character {found:?} in '{value}'")]
    InvalidCharacter { value: String, found: char },

    /// The unit name has no recognised type suffix.
    #[error("unit name '{0}' has no supported type suffix")]
    MissingUnitType(String),

    /// The identifier format is invalid.
    #[error("invalid identifier format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
