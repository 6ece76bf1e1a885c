//! Event type definitions.

use chrono::{DateTime, Utc};
use flotilla_id::{MachineId, UnitName};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Unit
    pub const UNIT_CREATED: &str = "unit.created";
    pub const UNIT_DESTROYED: &str = "unit.destroyed";
    pub const UNIT_TARGET_STATE_CHANGED: &str = "unit.target_state_changed";
    pub const UNIT_SCHEDULE_CHANGED: &str = "unit.schedule_changed";
    pub const UNIT_STATE_CHANGED: &str = "unit.state_changed";

    // Machine
    pub const MACHINE_CREATED: &str = "machine.created";
    pub const MACHINE_LOST: &str = "machine.lost";
}

// =============================================================================
// Events
// =============================================================================

/// Discriminant of a [`RegistryEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UnitCreated,
    UnitDestroyed,
    TargetStateChanged,
    ScheduleChanged,
    MachineCreated,
    MachineLost,
    UnitStateChanged,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 7] = [
        EventKind::UnitCreated,
        EventKind::UnitDestroyed,
        EventKind::TargetStateChanged,
        EventKind::ScheduleChanged,
        EventKind::MachineCreated,
        EventKind::MachineLost,
        EventKind::UnitStateChanged,
    ];

    /// Dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UnitCreated => event_types::UNIT_CREATED,
            Self::UnitDestroyed => event_types::UNIT_DESTROYED,
            Self::TargetStateChanged => event_types::UNIT_TARGET_STATE_CHANGED,
            Self::ScheduleChanged => event_types::UNIT_SCHEDULE_CHANGED,
            Self::MachineCreated => event_types::MACHINE_CREATED,
            Self::MachineLost => event_types::MACHINE_LOST,
            Self::UnitStateChanged => event_types::UNIT_STATE_CHANGED,
        }
    }

    /// Parse a dotted event type name.
    pub fn from_event_type(s: &str) -> Result<Self, EventError> {
        Self::ALL
            .into_iter()
            .find(|k| k.event_type() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// A classified change to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    UnitCreated {
        unit: UnitName,
    },
    UnitDestroyed {
        unit: UnitName,
    },
    TargetStateChanged {
        unit: UnitName,
    },
    /// `machine` is the new target; `None` when the unit was unscheduled.
    ScheduleChanged {
        unit: UnitName,
        machine: Option<MachineId>,
    },
    MachineCreated {
        machine: MachineId,
    },
    MachineLost {
        machine: MachineId,
    },
    /// `machine` is the reporter of the state record, when known.
    UnitStateChanged {
        unit: UnitName,
        machine: Option<MachineId>,
    },
}

impl RegistryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::UnitCreated { .. } => EventKind::UnitCreated,
            Self::UnitDestroyed { .. } => EventKind::UnitDestroyed,
            Self::TargetStateChanged { .. } => EventKind::TargetStateChanged,
            Self::ScheduleChanged { .. } => EventKind::ScheduleChanged,
            Self::MachineCreated { .. } => EventKind::MachineCreated,
            Self::MachineLost { .. } => EventKind::MachineLost,
            Self::UnitStateChanged { .. } => EventKind::UnitStateChanged,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }

    /// The unit this event is about, if it is a unit event.
    pub fn unit(&self) -> Option<&UnitName> {
        match self {
            Self::UnitCreated { unit }
            | Self::UnitDestroyed { unit }
            | Self::TargetStateChanged { unit }
            | Self::ScheduleChanged { unit, .. }
            | Self::UnitStateChanged { unit, .. } => Some(unit),
            Self::MachineCreated { .. } | Self::MachineLost { .. } => None,
        }
    }

    /// The machine this event names, if any.
    pub fn machine(&self) -> Option<&MachineId> {
        match self {
            Self::MachineCreated { machine } | Self::MachineLost { machine } => Some(machine),
            Self::ScheduleChanged { machine, .. } | Self::UnitStateChanged { machine, .. } => {
                machine.as_ref()
            }
            Self::UnitCreated { .. } | Self::UnitDestroyed { .. } | Self::TargetStateChanged { .. } => {
                None
            }
        }
    }
}

/// A registry event together with where and when it was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedEvent {
    /// KV modification index that produced the event.
    pub index: u64,
    /// KV key that changed.
    pub key: String,
    pub observed_at: DateTime<Utc>,
    pub event: RegistryEvent,
}

impl ObservedEvent {
    pub fn new(index: u64, key: impl Into<String>, event: RegistryEvent) -> Self {
        Self {
            index,
            key: key.into(),
            observed_at: Utc::now(),
            event,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
