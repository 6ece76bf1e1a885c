//! # flotilla-events
//!
//! Domain events derived from registry changes.
//!
//! ## Design Principles
//!
//! - Events are notifications, not state: consumers always re-read the
//!   registry before acting on one
//! - Every event names exactly one unit or one machine
//! - A batch of events may be coalesced; dropping a duplicate never loses
//!   information
//!
//! ## Event Types
//!
//! - Unit events (`unit.*`): created, destroyed, target state changed,
//!   schedule changed, state reported
//! - Machine events (`machine.*`): created, lost

mod error;
mod types;

pub use error::EventError;
pub use types::*;
