//! What this agent has asked of its supervisor.

use std::collections::BTreeMap;

use flotilla_id::UnitName;
use flotilla_unit::{TargetState, UnitHash};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedUnit {
    hash: UnitHash,
    state: TargetState,
}

/// Per-unit record of the last file loaded and the state requested.
///
/// Fills in the hash when the supervisor does not report one.
#[derive(Debug, Clone, Default)]
pub struct UnitCache {
    units: BTreeMap<UnitName, CachedUnit>,
}

impl UnitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded(&mut self, name: &UnitName, hash: UnitHash) {
        self.units.insert(
            name.clone(),
            CachedUnit {
                hash,
                state: TargetState::Loaded,
            },
        );
    }

    pub fn launched(&mut self, name: &UnitName) {
        if let Some(unit) = self.units.get_mut(name) {
            unit.state = TargetState::Launched;
        }
    }

    pub fn stopped(&mut self, name: &UnitName) {
        if let Some(unit) = self.units.get_mut(name) {
            unit.state = TargetState::Loaded;
        }
    }

    pub fn unloaded(&mut self, name: &UnitName) {
        self.units.remove(name);
    }

    pub fn hash(&self, name: &UnitName) -> Option<&UnitHash> {
        self.units.get(name).map(|u| &u.hash)
    }

    pub fn state(&self, name: &UnitName) -> TargetState {
        self.units.get(name).map_or(TargetState::Inactive, |u| u.state)
    }

    /// Units this agent launched, sorted by name.
    pub fn launched_units(&self) -> impl Iterator<Item = &UnitName> {
        self.units
            .iter()
            .filter(|(_, u)| u.state == TargetState::Launched)
            .map(|(name, _)| name)
    }

    /// Forget units the supervisor no longer has.
    pub fn retain(&mut self, mut keep: impl FnMut(&UnitName) -> bool) {
        self.units.retain(|name, _| keep(name));
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
