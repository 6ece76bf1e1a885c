//! # flotilla-id
//!
//! Identifier types shared by every flotilla component.
//!
//! ## Design Principles
//!
//! - Identifiers are validated once, at the boundary, and typed afterwards
//! - Every identifier is safe to embed as a single KV key segment
//! - Unit names and machine ids are never interchangeable
//!
//! ## Formats
//!
//! - Unit names carry a supervisor type suffix: `web.service`,
//!   `backup@nightly.timer`, `ssh@.socket`
//! - Machine ids are opaque tokens, conventionally 32 lowercase hex
//!   characters (`/etc/machine-id` style). The first 8 characters form the
//!   short id accepted wherever a user names a machine.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
