//! Schedule verbs: unit-to-machine assignments.

use std::collections::{BTreeMap, BTreeSet};

use flotilla_id::{MachineId, UnitName};
use flotilla_unit::TargetState;
use tracing::{debug, warn};

use super::{decode_str, Registry};
use crate::keys::ParsedKey;
use crate::kv::{Condition, KvEntry, PutOptions};
use crate::{RegistryError, RegistryResult, ScheduledUnit};

/// Raw per-unit keys gathered from one listing of the unit directory.
#[derive(Default)]
struct UnitKeys {
    has_object: bool,
    target: Option<MachineId>,
    target_state: TargetState,
    heartbeat: Option<MachineId>,
}

impl Registry {
    /// The scheduling projection of every unit, sorted by name.
    pub async fn schedule(&self) -> RegistryResult<Vec<ScheduledUnit>> {
        let units_dir = self.keys.units_dir();
        let states_dir = self.keys.states_dir();
        let unit_entries = self.call("schedule", || self.store.list(&units_dir)).await?;
        let state_entries = self
            .call("schedule_states", || self.store.list(&states_dir))
            .await?;

        let mut units: BTreeMap<UnitName, UnitKeys> = BTreeMap::new();
        for entry in &unit_entries {
            let Some(parsed) = self.keys.parse(&entry.key) else {
                continue;
            };
            match parsed {
                ParsedKey::UnitObject(name) => units.entry(name).or_default().has_object = true,
                ParsedKey::UnitTarget(name) => {
                    units.entry(name).or_default().target = parse_machine(entry);
                }
                ParsedKey::UnitTargetState(name) => {
                    let state = decode_str(&entry.key, &entry.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default();
                    units.entry(name).or_default().target_state = state;
                }
                ParsedKey::UnitHeartbeat(name) => {
                    units.entry(name).or_default().heartbeat = parse_machine(entry);
                }
                _ => {}
            }
        }

        let mut reporting: BTreeSet<(UnitName, MachineId)> = BTreeSet::new();
        for entry in &state_entries {
            if let Some(ParsedKey::UnitState(name, machine)) = self.keys.parse(&entry.key) {
                reporting.insert((name, machine));
            }
        }

        Ok(units
            .into_iter()
            .filter(|(_, keys)| keys.has_object)
            .map(|(name, keys)| project(name, keys, &reporting))
            .collect())
    }

    /// The scheduling projection of one unit.
    pub async fn scheduled_unit(&self, name: &UnitName) -> RegistryResult<Option<ScheduledUnit>> {
        let dir = self.keys.unit_dir(name);
        let entries = self.call("scheduled_unit", || self.store.list(&dir)).await?;

        let mut keys = UnitKeys::default();
        for entry in &entries {
            match self.keys.parse(&entry.key) {
                Some(ParsedKey::UnitObject(_)) => keys.has_object = true,
                Some(ParsedKey::UnitTarget(_)) => keys.target = parse_machine(entry),
                Some(ParsedKey::UnitTargetState(_)) => {
                    keys.target_state = decode_str(&entry.key, &entry.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default();
                }
                Some(ParsedKey::UnitHeartbeat(_)) => keys.heartbeat = parse_machine(entry),
                _ => {}
            }
        }
        if !keys.has_object {
            return Ok(None);
        }

        let mut reporting = BTreeSet::new();
        if let Some(target) = &keys.target {
            let state_key = self.keys.unit_state(name, target);
            if self
                .call("scheduled_unit_state", || self.store.get(&state_key))
                .await?
                .is_some()
            {
                reporting.insert((name.clone(), target.clone()));
            }
        }
        Ok(Some(project(name.clone(), keys, &reporting)))
    }

    /// Assign a unit to a machine.
    ///
    /// Re-assigning to the same machine succeeds; a unit already assigned to
    /// a different machine fails with `AlreadyExists`.
    pub async fn schedule_unit(&self, name: &UnitName, machine: &MachineId) -> RegistryResult<()> {
        let key = self.keys.unit_target(name);
        let value = machine.as_str().as_bytes().to_vec();
        let result = self
            .call_once("schedule_unit", || {
                self.store.put(&key, value.clone(), PutOptions::when(Condition::MustNotExist))
            })
            .await;

        match result {
            Ok(_) => {
                debug!(unit = %name, machine = %machine, "Scheduled unit");
                Ok(())
            }
            Err(RegistryError::AlreadyExists(_)) => {
                let current = self.call("unit_target", || self.store.get(&key)).await?;
                match current.as_ref().and_then(parse_machine) {
                    Some(existing) if &existing == machine => Ok(()),
                    Some(existing) => Err(RegistryError::AlreadyExists(format!(
                        "unit {name} already scheduled to {existing}"
                    ))),
                    None => Err(RegistryError::PreconditionFailed(format!(
                        "schedule of {name} changed concurrently"
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Clear a unit's assignment if it still names `machine`.
    pub async fn unschedule_unit(&self, name: &UnitName, machine: &MachineId) -> RegistryResult<()> {
        let key = self.keys.unit_target(name);
        let expected = machine.as_str().as_bytes().to_vec();
        match self
            .call("unschedule_unit", || {
                self.store.delete(&key, Condition::PrevValue(expected.clone()))
            })
            .await
        {
            Ok(_) => {
                debug!(unit = %name, machine = %machine, "Unscheduled unit");
                Ok(())
            }
            Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn parse_machine(entry: &KvEntry) -> Option<MachineId> {
    let raw = decode_str(&entry.key, &entry.value).ok()?;
    match MachineId::parse(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(key = %entry.key, error = %e, "Ignoring unreadable machine id");
            None
        }
    }
}

fn project(
    name: UnitName,
    keys: UnitKeys,
    reporting: &BTreeSet<(UnitName, MachineId)>,
) -> ScheduledUnit {
    let current_state = match &keys.target {
        Some(target) if reporting.contains(&(name.clone(), target.clone())) => {
            if keys.heartbeat.as_ref() == Some(target) {
                TargetState::Launched
            } else {
                TargetState::Loaded
            }
        }
        _ => TargetState::Inactive,
    };
    ScheduledUnit {
        name,
        target_machine: keys.target,
        current_state,
        target_state: keys.target_state,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flotilla_unit::{TargetState, UnitState};

    use super::super::test_support::{machine, registry, unit};

    fn state(name: &str, m: &str) -> UnitState {
        UnitState {
            unit_name: name.parse().unwrap(),
            unit_hash: flotilla_unit::UnitHash::of_bytes(name.as_bytes()),
            load_state: "loaded".to_string(),
            active_state: "active".to_string(),
            sub_state: "running".to_string(),
            machine_id: machine(m),
        }
    }

    #[tokio::test]
    async fn test_schedule_projection_covers_every_unit() {
        let (_, registry) = registry();
        registry.create_unit(&unit("a.service", TargetState::Launched)).await.unwrap();
        registry.create_unit(&unit("b.service", TargetState::Inactive)).await.unwrap();

        let schedule = registry.schedule().await.unwrap();
        assert_eq!(schedule.len(), 2);
        assert!(schedule.iter().all(|s| !s.is_scheduled()));
        assert_eq!(schedule[0].target_state, TargetState::Launched);
        assert_eq!(schedule[1].target_state, TargetState::Inactive);
    }

    #[tokio::test]
    async fn test_schedule_unit_conflicts() {
        let (_, registry) = registry();
        let u = unit("a.service", TargetState::Launched);
        registry.create_unit(&u).await.unwrap();

        registry.schedule_unit(&u.name, &machine("m1")).await.unwrap();
        registry.schedule_unit(&u.name, &machine("m1")).await.unwrap();
        let err = registry.schedule_unit(&u.name, &machine("m2")).await.unwrap_err();
        assert!(err.is_already_exists());

        let scheduled = registry.scheduled_unit(&u.name).await.unwrap().unwrap();
        assert_eq!(scheduled.target_machine, Some(machine("m1")));
    }

    #[tokio::test]
    async fn test_unschedule_is_compare_and_delete() {
        let (_, registry) = registry();
        let u = unit("a.service", TargetState::Launched);
        registry.create_unit(&u).await.unwrap();
        registry.schedule_unit(&u.name, &machine("m1")).await.unwrap();

        assert!(registry
            .unschedule_unit(&u.name, &machine("m2"))
            .await
            .unwrap_err()
            .is_precondition_failed());
        registry.unschedule_unit(&u.name, &machine("m1")).await.unwrap();
        registry.unschedule_unit(&u.name, &machine("m1")).await.unwrap();

        let scheduled = registry.scheduled_unit(&u.name).await.unwrap().unwrap();
        assert!(!scheduled.is_scheduled());
    }

    #[tokio::test]
    async fn test_current_state_is_derived() {
        let (_, registry) = registry();
        let u = unit("a.service", TargetState::Launched);
        registry.create_unit(&u).await.unwrap();
        registry.schedule_unit(&u.name, &machine("m1")).await.unwrap();
        let current = || async { registry.scheduled_unit(&u.name).await.unwrap().unwrap().current_state };

        assert_eq!(current().await, TargetState::Inactive);

        registry
            .save_unit_state(&u.name, &state("a.service", "m1"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(current().await, TargetState::Loaded);

        registry
            .unit_heartbeat(&u.name, &machine("m1"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(current().await, TargetState::Launched);
        assert_eq!(registry.schedule().await.unwrap()[0].current_state, TargetState::Launched);
    }

    #[tokio::test]
    async fn test_scheduled_unit_absent() {
        let (_, registry) = registry();
        let name = "missing.service".parse().unwrap();
        assert!(registry.scheduled_unit(&name).await.unwrap().is_none());
    }
}
