//! Unit file errors.

use thiserror::Error;

/// Errors produced while parsing unit files and their options.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitFileError {
    /// The body is not valid UTF-8.
    #[error("unit file is not valid UTF-8")]
    NotUtf8,

    /// A line could not be parsed.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// The `[X-Fleet]` section names an option nobody understands.
    #[error("unrecognized option in [X-Fleet] section: {0:?}")]
    UnknownOption(String),

    /// An option value is malformed.
    #[error("invalid value {value:?} for option {option}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    /// A hash string is not a hex sha256 digest.
    #[error("invalid unit hash {0:?}")]
    InvalidHash(String),

    /// A target state string is not one of inactive, loaded, launched.
    #[error("invalid target state {0:?}")]
    InvalidTargetState(String),
}
