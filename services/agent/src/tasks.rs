//! Agent task calculation.
//!
//! Compares what should run on this machine with what the supervisor has
//! loaded and produces an ordered task list. Stops and unloads come before
//! loads and starts so that a unit being replaced frees its slot first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use flotilla_id::UnitName;
use flotilla_unit::{TargetState, UnitHash};

pub const REASON_SCHEDULED_BUT_UNLOADED: &str = "unit scheduled here but not loaded";
pub const REASON_LOADED_BUT_NOT_SCHEDULED: &str = "unit loaded but not scheduled here";
pub const REASON_LOADED_BUT_HASH_DIFFERS: &str = "unit loaded but hash differs to expected";
pub const REASON_DESIRED_LAUNCHED: &str = "unit currently loaded but desired state is launched";
pub const REASON_DESIRED_LOADED: &str = "unit currently launched but desired state is loaded";
pub const REASON_PURGING_AGENT: &str = "purging agent";

/// Kinds of agent work, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentTaskKind {
    StopUnit,
    UnloadUnit,
    LoadUnit,
    StartUnit,
}

impl fmt::Display for AgentTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StopUnit => "StopUnit",
            Self::UnloadUnit => "UnloadUnit",
            Self::LoadUnit => "LoadUnit",
            Self::StartUnit => "StartUnit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTask {
    pub kind: AgentTaskKind,
    pub unit: UnitName,
    pub reason: &'static str,
}

impl AgentTask {
    pub fn new(kind: AgentTaskKind, unit: &UnitName, reason: &'static str) -> Self {
        Self {
            kind,
            unit: unit.clone(),
            reason,
        }
    }
}

/// A unit that should be on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredUnit {
    pub hash: UnitHash,
    pub target_state: TargetState,
}

/// A unit the supervisor has loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedUnit {
    /// Unknown when neither the supervisor nor the agent recorded it.
    pub hash: Option<UnitHash>,
    pub running: bool,
}

/// Ordered tasks that converge `current` to `desired`.
pub fn calculate_tasks(
    desired: &BTreeMap<UnitName, DesiredUnit>,
    current: &BTreeMap<UnitName, LoadedUnit>,
) -> Vec<AgentTask> {
    let names: BTreeSet<&UnitName> = desired.keys().chain(current.keys()).collect();
    let mut tasks: Vec<AgentTask> = names
        .into_iter()
        .flat_map(|name| tasks_for_unit(name, desired.get(name), current.get(name)))
        .collect();
    // Stable: per-unit order is kept within each kind.
    tasks.sort_by_key(|t| t.kind);
    tasks
}

fn tasks_for_unit(
    name: &UnitName,
    desired: Option<&DesiredUnit>,
    current: Option<&LoadedUnit>,
) -> Vec<AgentTask> {
    use AgentTaskKind::*;

    let desired = desired.filter(|d| d.target_state != TargetState::Inactive);
    let Some(desired) = desired else {
        return match current {
            Some(_) => vec![AgentTask::new(UnloadUnit, name, REASON_LOADED_BUT_NOT_SCHEDULED)],
            None => Vec::new(),
        };
    };
    let launch = desired.target_state == TargetState::Launched;

    let Some(current) = current else {
        let mut tasks = vec![AgentTask::new(LoadUnit, name, REASON_SCHEDULED_BUT_UNLOADED)];
        if launch {
            tasks.push(AgentTask::new(StartUnit, name, REASON_DESIRED_LAUNCHED));
        }
        return tasks;
    };

    if current.hash.as_ref().is_some_and(|h| *h != desired.hash) {
        let mut tasks = vec![
            AgentTask::new(UnloadUnit, name, REASON_LOADED_BUT_HASH_DIFFERS),
            AgentTask::new(LoadUnit, name, REASON_SCHEDULED_BUT_UNLOADED),
        ];
        if launch {
            tasks.push(AgentTask::new(StartUnit, name, REASON_DESIRED_LAUNCHED));
        }
        return tasks;
    }

    match (launch, current.running) {
        (true, false) => vec![AgentTask::new(StartUnit, name, REASON_DESIRED_LAUNCHED)],
        (false, true) => vec![AgentTask::new(StopUnit, name, REASON_DESIRED_LOADED)],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use flotilla_testing::unit_name;
    use rstest::rstest;

    use super::*;
    use super::AgentTaskKind::*;

    fn hash(s: &str) -> UnitHash {
        UnitHash::of_bytes(s.as_bytes())
    }

    fn desired(target: TargetState) -> DesiredUnit {
        DesiredUnit {
            hash: hash("v1"),
            target_state: target,
        }
    }

    fn loaded(h: Option<&str>, running: bool) -> LoadedUnit {
        LoadedUnit {
            hash: h.map(hash),
            running,
        }
    }

    fn kinds(
        desired_unit: Option<DesiredUnit>,
        loaded_unit: Option<LoadedUnit>,
    ) -> Vec<AgentTaskKind> {
        let name = unit_name("a.service");
        let wanted: BTreeMap<_, _> = desired_unit.map(|d| (name.clone(), d)).into_iter().collect();
        let current: BTreeMap<_, _> = loaded_unit.map(|l| (name.clone(), l)).into_iter().collect();
        calculate_tasks(&wanted, &current).into_iter().map(|t| t.kind).collect()
    }

    #[rstest]
    #[case::nothing(None, None, vec![])]
    #[case::stray(None, Some(loaded(Some("v1"), true)), vec![UnloadUnit])]
    #[case::inactive(Some(desired(TargetState::Inactive)), Some(loaded(Some("v1"), false)), vec![UnloadUnit])]
    #[case::inactive_unloaded(Some(desired(TargetState::Inactive)), None, vec![])]
    #[case::load_only(Some(desired(TargetState::Loaded)), None, vec![LoadUnit])]
    #[case::load_and_start(Some(desired(TargetState::Launched)), None, vec![LoadUnit, StartUnit])]
    #[case::start(Some(desired(TargetState::Launched)), Some(loaded(Some("v1"), false)), vec![StartUnit])]
    #[case::stop(Some(desired(TargetState::Loaded)), Some(loaded(Some("v1"), true)), vec![StopUnit])]
    #[case::converged_launched(Some(desired(TargetState::Launched)), Some(loaded(Some("v1"), true)), vec![])]
    #[case::converged_loaded(Some(desired(TargetState::Loaded)), Some(loaded(Some("v1"), false)), vec![])]
    #[case::hash_differs(Some(desired(TargetState::Launched)), Some(loaded(Some("v0"), true)), vec![UnloadUnit, LoadUnit, StartUnit])]
    #[case::hash_unknown(Some(desired(TargetState::Launched)), Some(loaded(None, true)), vec![])]
    fn test_tasks_for_unit(
        #[case] desired_unit: Option<DesiredUnit>,
        #[case] loaded_unit: Option<LoadedUnit>,
        #[case] expected: Vec<AgentTaskKind>,
    ) {
        assert_eq!(kinds(desired_unit, loaded_unit), expected);
    }

    #[test]
    fn test_stops_and_unloads_come_first() {
        let mut wanted = BTreeMap::new();
        wanted.insert(unit_name("a.service"), desired(TargetState::Launched));
        wanted.insert(unit_name("c.service"), desired(TargetState::Loaded));
        let mut current = BTreeMap::new();
        current.insert(unit_name("b.service"), loaded(Some("v1"), true));
        current.insert(unit_name("c.service"), loaded(Some("v1"), true));

        let tasks = calculate_tasks(&wanted, &current);
        let order: Vec<_> = tasks.iter().map(|t| (t.kind, t.unit.as_str())).collect();
        assert_eq!(
            order,
            vec![
                (StopUnit, "c.service"),
                (UnloadUnit, "b.service"),
                (LoadUnit, "a.service"),
                (StartUnit, "a.service"),
            ]
        );
        assert_eq!(tasks[1].reason, REASON_LOADED_BUT_NOT_SCHEDULED);
    }
}
