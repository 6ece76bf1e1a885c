//! Task calculation for one engine pass.
//!
//! `calculate_tasks` is a pure function of the snapshot. It runs in two
//! phases:
//!
//! 1. Unschedule every scheduled unit whose target state is inactive, whose
//!    machine went away, or whose machine can no longer run it.
//! 2. Schedule every unscheduled unit that should be running, against a
//!    working copy of the snapshot that already reflects earlier decisions
//!    of the same pass.

use std::fmt;

use flotilla_id::{MachineId, UnitName};
use flotilla_unit::TargetState;

use crate::scheduler::{Decision, Scheduler};
use crate::snapshot::ClusterSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Schedule,
    Unschedule,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schedule => f.write_str("schedule"),
            Self::Unschedule => f.write_str("unschedule"),
        }
    }
}

/// One registry mutation the engine wants to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub unit: UnitName,
    pub machine: MachineId,
    pub reason: String,
}

impl Task {
    fn schedule(unit: &UnitName, machine: &MachineId, reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Schedule,
            unit: unit.clone(),
            machine: machine.clone(),
            reason: reason.into(),
        }
    }

    fn unschedule(unit: &UnitName, machine: &MachineId, reason: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Unschedule,
            unit: unit.clone(),
            machine: machine.clone(),
            reason: reason.into(),
        }
    }
}

/// Output of a task calculation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Tasks in the order they must be applied.
    pub tasks: Vec<Task>,
    /// Units that should run but could not be placed, with the reason.
    pub deferred: Vec<(UnitName, String)>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Compute the tasks that move the schedule towards the desired state.
pub fn calculate_tasks(snapshot: &ClusterSnapshot, scheduler: &Scheduler) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut working = snapshot.clone();

    // Phase 1: unschedule.
    for unit in snapshot.units() {
        let Some(machine) = snapshot.target(unit.name()) else {
            continue;
        };

        let reason = if unit.target_state() == TargetState::Inactive {
            Some("target state inactive".to_string())
        } else if !snapshot.has_machine(machine) && !is_pinned_to(unit.options.machine_id.as_deref(), machine) {
            Some(format!("target Machine({machine}) went away"))
        } else if snapshot.has_machine(machine) {
            scheduler
                .able_to_run(snapshot, unit, machine)
                .err()
                .map(|why| format!("unable to run unit: {why}"))
        } else {
            None
        };

        if let Some(reason) = reason {
            plan.tasks.push(Task::unschedule(unit.name(), machine, reason));
            working.unplace(unit.name());
        }
    }

    // Phase 2: schedule. Units without peers go first so that a group's
    // anchor is placed before the units that follow it.
    let mut pending: Vec<_> = snapshot
        .units()
        .filter(|u| u.target_state() != TargetState::Inactive)
        .filter(|u| !u.options.global)
        .filter(|u| working.target(u.name()).is_none())
        .collect();
    pending.sort_by_key(|u| (!u.options.peers.is_empty(), u.name().clone()));

    for unit in pending {
        match scheduler.decide(&working, unit) {
            Decision::Place(machine) => {
                plan.tasks.push(Task::schedule(
                    unit.name(),
                    &machine,
                    format!("target state {} and unit not scheduled", unit.target_state()),
                ));
                working.place(unit.name(), &machine);
            }
            Decision::Defer(reason) => plan.deferred.push((unit.name().clone(), reason)),
        }
    }

    plan
}

/// A unit pinned to an absent machine keeps its placement until the
/// machine appears.
fn is_pinned_to(pin: Option<&str>, machine: &MachineId) -> bool {
    pin.is_some_and(|pin| machine.matches(pin))
}
