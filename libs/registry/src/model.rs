//! Entities persisted in the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flotilla_id::{MachineId, UnitName};
use flotilla_unit::{
    ResourceTuple, SchedulingOptions, TargetState, UnitFile, UnitFileError, UnitHash,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// =============================================================================
// Units
// =============================================================================

/// A unit: name, immutable payload and desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: UnitName,
    pub file: UnitFile,
    pub hash: UnitHash,
    pub target_state: TargetState,
}

impl Unit {
    pub fn new(name: UnitName, file: UnitFile, target_state: TargetState) -> Self {
        let hash = file.hash();
        Self {
            name,
            file,
            hash,
            target_state,
        }
    }

    /// Scheduling options from the `[X-Fleet]` section.
    pub fn options(&self) -> Result<SchedulingOptions, UnitFileError> {
        SchedulingOptions::from_unit(&self.name, &self.file)
    }

    /// Normalised payload stored under the unit's hash.
    pub fn payload(&self) -> Vec<u8> {
        self.file.serialize().into_bytes()
    }
}

/// Stored form of `<prefix>/unit/<name>/object`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UnitObject {
    pub name: UnitName,
    pub hash: UnitHash,
}

/// Scheduling projection of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledUnit {
    pub name: UnitName,
    /// Machine the unit is assigned to, if any.
    pub target_machine: Option<MachineId>,
    /// Derived from the target's unit state and heartbeat.
    pub current_state: TargetState,
    pub target_state: TargetState,
}

impl ScheduledUnit {
    pub fn is_scheduled(&self) -> bool {
        self.target_machine.is_some()
    }
}

// =============================================================================
// Machines
// =============================================================================

/// A cluster member as published by its agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub id: MachineId,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub total_resources: ResourceTuple,
    #[serde(default)]
    pub free_resources: ResourceTuple,
    #[serde(default)]
    pub loaded_units: u32,
    #[serde(default)]
    pub version: String,
    pub published_at: DateTime<Utc>,
}

impl MachineState {
    pub fn new(id: MachineId) -> Self {
        Self {
            id,
            public_ip: String::new(),
            metadata: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            total_resources: ResourceTuple::default(),
            free_resources: ResourceTuple::default(),
            loaded_units: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
            published_at: Utc::now(),
        }
    }
}

// =============================================================================
// Leases
// =============================================================================

/// A fenced, TTL-bound claim on a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: MachineId,
    pub version: u32,
    /// Modification index of the lease key; every renewal, steal and release
    /// must present it.
    pub index: u64,
    pub expires_at: Option<Instant>,
}

impl Lease {
    /// Time left before the lease lapses.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    pub fn is_held_by(&self, machine: &MachineId) -> bool {
        &self.holder == machine
    }
}

/// Stored form of `<prefix>/lease/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseValue {
    pub holder: MachineId,
    pub version: u32,
}
