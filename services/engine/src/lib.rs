//! flotilla cluster engine.
//!
//! Exactly one engine in the cluster leads at a time, elected through a
//! fenced lease. The leader turns registry state into placement decisions:
//!
//! - `snapshot`: immutable view of the registry for one pass
//! - `scheduler`: pure placement policy
//! - `reconciler`: schedule and unschedule tasks for a snapshot
//! - `leadership`: lease acquisition, renewal and stealing
//! - `engine`: one tick of the leader state machine
//! - `worker`: the periodic, trigger-driven loop around it

pub mod engine;
mod error;
pub mod leadership;
pub mod reconciler;
pub mod scheduler;
pub mod snapshot;
pub mod worker;

pub use engine::{Engine, EngineConfig, EngineStats, Role, ENGINE_VERSION};
pub use error::{EngineError, EngineResult};
pub use leadership::{LeaseManager, Leadership, ENGINE_LEASE_NAME};
pub use reconciler::{calculate_tasks, ReconcilePlan, Task, TaskKind};
pub use scheduler::{decide, Decision, Scheduler, DEFAULT_CANDIDATE_POOL};
pub use snapshot::{ClusterSnapshot, SnapshotUnit};
pub use worker::EngineWorker;
