//! # flotilla-registry
//!
//! The registry is the only component that touches the KV store. It turns
//! KV primitives (get, list, conditional put, conditional delete, TTL keys
//! and prefix watches) into typed verbs over units, the schedule, machines,
//! unit state, leases and the engine version.
//!
//! ## Key layout
//!
//! ```text
//! <prefix>/unit/<name>/object          {"name","hash"}
//! <prefix>/unit/<name>/target-state    inactive | loaded | launched
//! <prefix>/unit/<name>/target          machine id (absent when unscheduled)
//! <prefix>/unit/<name>/heartbeat       machine id, TTL
//! <prefix>/unit-blob/<hash>            normalised unit file body
//! <prefix>/machines/<id>/object        MachineState, TTL
//! <prefix>/machines/<id>/metadata/<k>  dynamic metadata value
//! <prefix>/states/<name>/<id>          UnitState, TTL
//! <prefix>/lease/<name>                {"holder","version"}, TTL
//! <prefix>/engine/version              integer
//! ```
//!
//! ## Modules
//!
//! - `kv`: the KV store contract
//! - `memory`: in-process reference store (linearizable, TTLs, watches)
//! - `keys`: key layout and key classification
//! - `registry`: typed verbs
//! - `pagination`: page tokens for listings
//! - `stream`: event stream turning KV changes into coalesced triggers

mod error;
pub mod keys;
pub mod kv;
pub mod memory;
mod model;
pub mod pagination;
mod registry;
pub mod stream;

pub use error::{RegistryError, RegistryResult};
pub use keys::{KeyLayout, ParsedKey, DEFAULT_KEY_PREFIX};
pub use kv::{Condition, KvAction, KvEntry, KvError, KvEvent, KvResult, KvStore, KvWatch, PutOptions};
pub use memory::MemoryStore;
pub use model::{Lease, MachineState, ScheduledUnit, Unit};
pub use pagination::{Page, PageToken, DEFAULT_PAGE_LIMIT};
pub use registry::{Registry, RegistryConfig};
pub use stream::{EventStream, EventStreamConfig, Trigger};
