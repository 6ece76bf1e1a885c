//! Immutable cluster snapshot.
//!
//! Built from one read of each registry listing per reconcile pass. Callers
//! see it read-only; task calculation records planned placements on its
//! own working copy.

use std::collections::{BTreeMap, BTreeSet};

use flotilla_id::{MachineId, UnitName};
use flotilla_registry::{MachineState, Registry, RegistryResult, ScheduledUnit, Unit};
use flotilla_unit::{ResourceTuple, SchedulingOptions, TargetState, UnitState};
use tracing::{debug, warn};

/// A unit together with its parsed scheduling options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUnit {
    pub unit: Unit,
    pub options: SchedulingOptions,
}

impl SnapshotUnit {
    pub fn name(&self) -> &UnitName {
        &self.unit.name
    }

    pub fn target_state(&self) -> TargetState {
        self.unit.target_state
    }
}

/// Point-in-time view of machines, units, the schedule and unit reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    machines: BTreeMap<MachineId, MachineState>,
    units: BTreeMap<UnitName, SnapshotUnit>,
    schedule: BTreeMap<UnitName, MachineId>,
    reporting: BTreeMap<UnitName, BTreeSet<MachineId>>,
}

impl ClusterSnapshot {
    /// Read the registry once and build a snapshot.
    pub async fn load(registry: &Registry) -> RegistryResult<Self> {
        let units = registry.units().await?;
        let schedule = registry.schedule().await?;
        let machines = registry.machines().await?;
        let states = registry.unit_states().await?;
        let snapshot = Self::from_parts(machines, units, schedule, states);
        debug!(
            machines = snapshot.machines.len(),
            units = snapshot.units.len(),
            scheduled = snapshot.schedule.len(),
            "Loaded cluster snapshot"
        );
        Ok(snapshot)
    }

    pub fn from_parts(
        machines: Vec<MachineState>,
        units: Vec<Unit>,
        schedule: Vec<ScheduledUnit>,
        states: Vec<UnitState>,
    ) -> Self {
        let machines = machines.into_iter().map(|m| (m.id.clone(), m)).collect();

        let mut snapshot_units = BTreeMap::new();
        for unit in units {
            match unit.options() {
                Ok(options) => {
                    snapshot_units.insert(unit.name.clone(), SnapshotUnit { unit, options });
                }
                Err(e) => warn!(unit = %unit.name, error = %e, "Ignoring unit with invalid options"),
            }
        }

        let schedule = schedule
            .into_iter()
            .filter(|s| snapshot_units.contains_key(&s.name))
            .filter_map(|s| s.target_machine.map(|m| (s.name, m)))
            .collect();

        let mut reporting: BTreeMap<UnitName, BTreeSet<MachineId>> = BTreeMap::new();
        for state in states {
            reporting.entry(state.unit_name).or_default().insert(state.machine_id);
        }

        Self {
            machines,
            units: snapshot_units,
            schedule,
            reporting,
        }
    }

    // -------------------------------------------------------------------------
    // Machines
    // -------------------------------------------------------------------------

    /// Live machines, sorted by id.
    pub fn machines(&self) -> impl Iterator<Item = &MachineState> {
        self.machines.values()
    }

    pub fn machine(&self, id: &MachineId) -> Option<&MachineState> {
        self.machines.get(id)
    }

    pub fn has_machine(&self, id: &MachineId) -> bool {
        self.machines.contains_key(id)
    }

    /// The live machine a pin designates, by full or short id.
    pub fn resolve_pin(&self, pin: &str) -> Option<&MachineId> {
        self.machines.keys().find(|id| id.matches(pin))
    }

    /// Number of units scheduled to `machine`.
    pub fn loaded_count(&self, machine: &MachineId) -> usize {
        self.schedule.values().filter(|m| *m == machine).count()
    }

    /// Published free resources minus reservations of units scheduled to
    /// `machine` that it has not reported yet.
    pub fn free_resources(&self, machine: &MachineId) -> ResourceTuple {
        let Some(state) = self.machines.get(machine) else {
            return ResourceTuple::default();
        };
        let pending: ResourceTuple = self
            .units_on(machine)
            .filter(|u| !self.is_reporting(u.name(), machine))
            .map(|u| u.options.resources)
            .sum();
        state.free_resources.saturating_sub(&pending)
    }

    // -------------------------------------------------------------------------
    // Units
    // -------------------------------------------------------------------------

    /// Units, sorted by name.
    pub fn units(&self) -> impl Iterator<Item = &SnapshotUnit> {
        self.units.values()
    }

    pub fn unit(&self, name: &UnitName) -> Option<&SnapshotUnit> {
        self.units.get(name)
    }

    /// Look a unit up by a name that may not be valid.
    pub fn unit_named(&self, name: &str) -> Option<&SnapshotUnit> {
        let name = UnitName::parse(name).ok()?;
        self.units.get(&name)
    }

    /// Machine a unit is scheduled to.
    pub fn target(&self, name: &UnitName) -> Option<&MachineId> {
        self.schedule.get(name)
    }

    /// Units scheduled to `machine`, sorted by name.
    pub fn units_on<'a>(&'a self, machine: &'a MachineId) -> impl Iterator<Item = &'a SnapshotUnit> + 'a {
        self.schedule
            .iter()
            .filter(move |(_, m)| *m == machine)
            .filter_map(|(name, _)| self.units.get(name))
    }

    /// True if `machine` has published a state for `name`.
    pub fn is_reporting(&self, name: &UnitName, machine: &MachineId) -> bool {
        self.reporting
            .get(name)
            .is_some_and(|machines| machines.contains(machine))
    }

    /// Machines that have published a state for `name`.
    pub fn reporters(&self, name: &UnitName) -> impl Iterator<Item = &MachineId> {
        self.reporting.get(name).into_iter().flatten()
    }

    // -------------------------------------------------------------------------
    // Planned changes
    // -------------------------------------------------------------------------

    /// Record `name` as scheduled to `machine`.
    pub(crate) fn place(&mut self, name: &UnitName, machine: &MachineId) {
        self.schedule.insert(name.clone(), machine.clone());
    }

    /// Record `name` as unscheduled.
    pub(crate) fn unplace(&mut self, name: &UnitName) {
        self.schedule.remove(name);
    }
}
