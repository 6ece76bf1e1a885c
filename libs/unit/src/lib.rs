//! Unit file library.
//!
//! A unit file is a systemd-style INI document. flotilla treats the body as
//! an opaque payload addressed by its content hash, with one exception: the
//! `[X-Fleet]` section carries the scheduling options the engine and agents
//! act on.
//!
//! # Format
//!
//! ```text
//! [Unit]
//! Description=web frontend
//!
//! [Service]
//! ExecStart=/usr/bin/web --port 80
//!
//! [X-Fleet]
//! Conflicts=web@*.service
//! MachineMetadata="region=us-east" "region=us-west"
//! MemoryMB=512
//! ```
//!
//! Bodies are normalised before hashing (comments, blank lines and
//! continuation lines removed, one `Key=value` per line), so two files that
//! differ only in formatting share a payload blob.

mod error;
mod file;
mod options;
mod resource;
mod state;

pub use error::UnitFileError;
pub use file::{UnitFile, UnitHash, UnitOption};
pub use options::{glob_matches, SchedulingOptions, FLEET_SECTION};
pub use resource::{ResourceTuple, HOST_RESERVED};
pub use state::{TargetState, UnitState};
