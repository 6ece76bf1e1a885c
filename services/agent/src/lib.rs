//! flotilla node agent.
//!
//! Every machine runs one agent. It converges the local supervisor to the
//! units scheduled to its machine and keeps the machine visible to the
//! cluster:
//!
//! - `supervisor`: the local unit supervisor interface and a mock
//! - `tasks`: the ordered stop/unload/load/start plan
//! - `agent`: one reconcile pass, unit-state publication and purge
//! - `heartbeat`: machine and unit TTL refresh loops
//! - `worker`: the periodic, trigger-driven loop around it

pub mod agent;
mod cache;
mod error;
pub mod heartbeat;
pub mod supervisor;
pub mod tasks;
pub mod worker;

pub use agent::{Agent, AgentConfig, AgentStats, DEFAULT_MACHINE_TTL};
pub use error::{AgentError, AgentResult};
pub use heartbeat::{run_machine_heartbeat, run_unit_heartbeat};
pub use supervisor::{MockSupervisor, Supervisor, SupervisorError, SupervisorResult, UnitStatus};
pub use tasks::{calculate_tasks, AgentTask, AgentTaskKind, DesiredUnit, LoadedUnit};
pub use worker::{agent_event_filter, AgentWorker};
