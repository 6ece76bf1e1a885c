//! Placement decisions.
//!
//! The scheduler is a pure function of a [`ClusterSnapshot`] and a unit: it
//! never mutates state and never calls the registry.
//!
//! Policy, in priority order:
//! 1. A pinned unit goes to its pin, whether or not that machine is live.
//! 2. Candidates are filtered by machine metadata, `MachineOf` affinity and
//!    `Conflicts` anti-affinity. An empty set defers the unit.
//! 3. A unit with a resource reservation goes to the candidate with the
//!    smallest free tuple that covers the reservation on every dimension.
//! 4. Otherwise the `candidate_pool` least-loaded candidates are taken and
//!    the one with the lowest id wins.

use std::collections::{BTreeMap, BTreeSet};

use flotilla_id::MachineId;

use crate::snapshot::{ClusterSnapshot, SnapshotUnit};

/// Default number of least-loaded machines considered.
pub const DEFAULT_CANDIDATE_POOL: usize = 5;

/// Outcome of a placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Place(MachineId),
    Defer(String),
}

impl Decision {
    pub fn machine(&self) -> Option<&MachineId> {
        match self {
            Self::Place(m) => Some(m),
            Self::Defer(_) => None,
        }
    }
}

/// Placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    candidate_pool: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CANDIDATE_POOL)
    }
}

impl Scheduler {
    pub fn new(candidate_pool: usize) -> Self {
        Self {
            candidate_pool: candidate_pool.max(1),
        }
    }

    /// Decide where `unit` should run.
    pub fn decide(&self, snapshot: &ClusterSnapshot, unit: &SnapshotUnit) -> Decision {
        let options = &unit.options;
        if options.global {
            return Decision::Defer("global units run on every machine and are not scheduled".to_string());
        }

        if let Some(pin) = &options.machine_id {
            if let Some(id) = snapshot.resolve_pin(pin) {
                return Decision::Place(id.clone());
            }
            return match MachineId::parse(pin) {
                Ok(id) => Decision::Place(id),
                Err(e) => Decision::Defer(format!("invalid machine pin {pin:?}: {e}")),
            };
        }

        let mut candidates: Vec<&MachineId> = snapshot
            .machines()
            .filter(|m| options.metadata_satisfied_by(&m.metadata))
            .map(|m| &m.id)
            .collect();
        if snapshot.machines().next().is_none() {
            return Decision::Defer("no machines available".to_string());
        }
        if candidates.is_empty() {
            return Decision::Defer("no machine satisfies the metadata requirements".to_string());
        }

        match affinity_target(snapshot, unit) {
            Affinity::Free => {}
            Affinity::Machine(target) => {
                candidates.retain(|m| **m == target);
                if candidates.is_empty() {
                    return Decision::Defer(format!(
                        "peers are scheduled to Machine({target}) which cannot run this unit"
                    ));
                }
            }
            Affinity::Blocked(reason) => return Decision::Defer(reason),
        }

        candidates.retain(|m| conflicting_unit(snapshot, unit, m).is_none());
        if candidates.is_empty() {
            return Decision::Defer("every candidate machine runs a conflicting unit".to_string());
        }

        let required = options.resources;
        if !required.is_empty() {
            return candidates
                .into_iter()
                .filter(|m| snapshot.free_resources(m).dominates(&required))
                .min_by_key(|m| (snapshot.free_resources(m), (*m).clone()))
                .map(|m| Decision::Place(m.clone()))
                .unwrap_or_else(|| {
                    Decision::Defer(format!(
                        "no machine has {} cores, {} MB memory and {} MB disk free",
                        required.cores, required.memory_mb, required.disk_mb
                    ))
                });
        }

        candidates.sort_by_key(|m| (snapshot.loaded_count(m), (*m).clone()));
        candidates.truncate(self.candidate_pool);
        candidates
            .into_iter()
            .min()
            .map(|m| Decision::Place(m.clone()))
            .unwrap_or_else(|| Decision::Defer("no candidate machines".to_string()))
    }

    /// Check that `machine` can still run `unit`. Returns the reason it
    /// cannot.
    pub fn able_to_run(
        &self,
        snapshot: &ClusterSnapshot,
        unit: &SnapshotUnit,
        machine: &MachineId,
    ) -> Result<(), String> {
        let options = &unit.options;
        if let Some(pin) = &options.machine_id {
            if !machine.matches(pin) {
                return Err(format!("Machine({machine}) does not match required {pin:?}"));
            }
        }

        if let Some(state) = snapshot.machine(machine) {
            if !options.metadata_satisfied_by(&state.metadata) {
                return Err(format!("Machine({machine}) metadata insufficient"));
            }
        }

        for peer in &options.peers {
            let elsewhere = snapshot
                .unit_named(peer)
                .and_then(|p| snapshot.target(p.name()))
                .filter(|m| *m != machine);
            if let Some(other) = elsewhere {
                return Err(format!("required peer Unit({peer}) is scheduled to Machine({other})"));
            }
        }

        if let Some(other) = conflicting_unit(snapshot, unit, machine) {
            return Err(format!("conflicts with Unit({other}) on Machine({machine})"));
        }
        Ok(())
    }
}

/// Decide where `unit` should run with the default policy.
pub fn decide(snapshot: &ClusterSnapshot, unit: &SnapshotUnit) -> Decision {
    Scheduler::default().decide(snapshot, unit)
}

/// First unit on `machine` that conflicts with `unit`, in either direction.
fn conflicting_unit<'a>(
    snapshot: &'a ClusterSnapshot,
    unit: &SnapshotUnit,
    machine: &'a MachineId,
) -> Option<&'a str> {
    snapshot
        .units_on(machine)
        .filter(|other| other.name() != unit.name())
        .find(|other| {
            unit.options.conflicts_with(other.name().as_str())
                || other.options.conflicts_with(unit.name().as_str())
        })
        .map(|other| other.name().as_str())
}

// =============================================================================
// Affinity
// =============================================================================

enum Affinity {
    /// No placed peer constrains the unit.
    Free,
    /// The unit must join its group on this machine.
    Machine(MachineId),
    Blocked(String),
}

/// Where `MachineOf` forces `unit` to go.
///
/// Peer relations are undirected: units linked through `MachineOf`, directly
/// or transitively, form one group that must share a machine. While no
/// member is placed only the group's anchor may be placed freely; the anchor
/// is the first member by name that declares no peers, or the first member
/// if every member declares some.
fn affinity_target(snapshot: &ClusterSnapshot, unit: &SnapshotUnit) -> Affinity {
    for peer in &unit.options.peers {
        if snapshot.unit_named(peer).is_none() {
            return Affinity::Blocked(format!("required peer Unit({peer}) does not exist"));
        }
    }

    let groups = AffinityGroups::build(snapshot);
    let members = groups.members_of(unit.name().as_str());
    if members.len() <= 1 {
        return Affinity::Free;
    }

    let placed: BTreeSet<&MachineId> = members
        .iter()
        .filter(|name| **name != unit.name().as_str())
        .filter_map(|name| snapshot.unit_named(name))
        .filter_map(|member| snapshot.target(member.name()))
        .collect();

    let mut placed = placed.into_iter();
    match (placed.next(), placed.next()) {
        (Some(target), None) => Affinity::Machine(target.clone()),
        (Some(a), Some(b)) => Affinity::Blocked(format!(
            "peers are split across Machine({a}) and Machine({b})"
        )),
        (None, _) => {
            let anchor = members
                .iter()
                .find(|name| {
                    snapshot
                        .unit_named(name)
                        .is_some_and(|m| m.options.peers.is_empty())
                })
                .or_else(|| members.first())
                .copied();
            if anchor == Some(unit.name().as_str()) {
                Affinity::Free
            } else {
                Affinity::Blocked(format!(
                    "required peer Unit({}) is not scheduled",
                    anchor.unwrap_or_default()
                ))
            }
        }
    }
}

/// Union-find over unit names linked by `MachineOf`.
struct AffinityGroups<'a> {
    index: BTreeMap<&'a str, usize>,
    names: Vec<&'a str>,
    parent: Vec<usize>,
}

impl<'a> AffinityGroups<'a> {
    fn build(snapshot: &'a ClusterSnapshot) -> Self {
        let names: Vec<&str> = snapshot.units().map(|u| u.name().as_str()).collect();
        let index = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut groups = Self {
            index,
            parent: (0..names.len()).collect(),
            names,
        };
        for unit in snapshot.units() {
            for peer in &unit.options.peers {
                groups.union(unit.name().as_str(), peer);
            }
        }
        groups
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: &str, b: &str) {
        let (Some(&a), Some(&b)) = (self.index.get(a), self.index.get(b)) else {
            return;
        };
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }

    /// Members of `name`'s group, sorted by name.
    fn members_of(mut self, name: &str) -> Vec<&'a str> {
        let Some(&i) = self.index.get(name) else {
            return Vec::new();
        };
        let root = self.find(i);
        let indices: Vec<usize> = (0..self.names.len()).filter(|j| self.find(*j) == root).collect();
        indices.into_iter().map(|j| self.names[j]).collect()
    }
}
