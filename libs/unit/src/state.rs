//! Lifecycle states of units.

use std::fmt;
use std::str::FromStr;

use flotilla_id::{MachineId, UnitName};
use serde::{Deserialize, Serialize};

use crate::{UnitFileError, UnitHash};

/// Desired (or derived current) lifecycle state of a unit.
///
/// Ordered: `Inactive < Loaded < Launched`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    #[default]
    Inactive,
    Loaded,
    Launched,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Loaded => "loaded",
            Self::Launched => "launched",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = UnitFileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "loaded" => Ok(Self::Loaded),
            "launched" => Ok(Self::Launched),
            other => Err(UnitFileError::InvalidTargetState(other.to_string())),
        }
    }
}

/// State of a unit as reported by the agent running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub unit_name: UnitName,
    pub unit_hash: UnitHash,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub machine_id: MachineId,
}

impl UnitState {
    /// True while the supervisor considers the unit running or starting.
    pub fn is_running(&self) -> bool {
        matches!(self.active_state.as_str(), "active" | "activating" | "reloading")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_state_order() {
        assert!(TargetState::Inactive < TargetState::Loaded);
        assert!(TargetState::Loaded < TargetState::Launched);
    }

    #[test]
    fn test_target_state_parse() {
        assert_eq!("launched".parse::<TargetState>().unwrap(), TargetState::Launched);
        assert!("running".parse::<TargetState>().is_err());
        assert_eq!(serde_json::to_string(&TargetState::Loaded).unwrap(), "\"loaded\"");
    }
}
