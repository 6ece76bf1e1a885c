//! Identifier definitions for units and machines.

use crate::{define_name, IdError};

/// Maximum length of any identifier, in bytes.
pub const MAX_NAME_LENGTH: usize = 256;

/// Length of the abbreviated machine id.
pub const SHORT_MACHINE_ID_LENGTH: usize = 8;

/// Unit type suffixes the local supervisor accepts.
pub const SUPPORTED_UNIT_TYPES: &[&str] = &[
    "service", "socket", "timer", "path", "device", "mount", "automount", "target",
];

fn validate_segment(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_NAME_LENGTH {
        return Err(IdError::TooLong {
            len: s.len(),
            max: MAX_NAME_LENGTH,
        });
    }
    if let Some(found) = s.chars().find(|c| *c == '/' || c.is_whitespace() || c.is_control()) {
        return Err(IdError::InvalidCharacter {
            value: s.to_string(),
            found,
        });
    }
    if s == "." || s == ".." {
        return Err(IdError::InvalidFormat {
            message: format!("'{s}' is not a valid key segment"),
        });
    }
    Ok(())
}

fn validate_machine_id(s: &str) -> Result<(), IdError> {
    validate_segment(s)
}

fn validate_unit_name(s: &str) -> Result<(), IdError> {
    validate_segment(s)?;
    let Some((base, suffix)) = s.rsplit_once('.') else {
        return Err(IdError::MissingUnitType(s.to_string()));
    };
    if base.is_empty() || !SUPPORTED_UNIT_TYPES.contains(&suffix) {
        return Err(IdError::MissingUnitType(s.to_string()));
    }
    if base.starts_with('@') {
        return Err(IdError::InvalidFormat {
            message: format!("unit name '{s}' has an empty template prefix"),
        });
    }
    Ok(())
}

// =============================================================================
// Machines
// =============================================================================

define_name!(
    /// Stable identifier of a cluster member.
    MachineId,
    validate_machine_id
);

impl MachineId {
    /// Generates a fresh random id in the 32 hex character machine-id form.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the abbreviated form of this id.
    #[must_use]
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(SHORT_MACHINE_ID_LENGTH) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Returns true if `candidate` names this machine, either in full or by
    /// its short id.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate || self.short() == candidate
    }
}

// =============================================================================
// Units
// =============================================================================

define_name!(
    /// Name of a unit, including its type suffix.
    UnitName,
    validate_unit_name
);

/// Decomposition of a unit name into its systemd-style parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNameInfo {
    /// Full name, e.g. `foo@bar.service`.
    pub full_name: String,
    /// Name without the type suffix, e.g. `foo@bar`.
    pub name: String,
    /// Part before `@`, or the whole name for plain units.
    pub prefix: String,
    /// Part after `@`, empty for plain units and templates.
    pub instance: String,
    /// Template this instance was created from, e.g. `foo@.service`.
    pub template: Option<String>,
    /// Type suffix, e.g. `service`.
    pub unit_type: String,
}

impl UnitNameInfo {
    /// True for `foo@.service`.
    pub fn is_template(&self) -> bool {
        self.template.is_some() && self.instance.is_empty()
    }

    /// True for `foo@bar.service`.
    pub fn is_instance(&self) -> bool {
        self.template.is_some() && !self.instance.is_empty()
    }
}

impl UnitName {
    /// Splits the name into prefix, instance and type.
    #[must_use]
    pub fn info(&self) -> UnitNameInfo {
        // Validation guarantees the suffix separator exists.
        let (name, unit_type) = self.0.rsplit_once('.').unwrap_or((self.0.as_str(), ""));
        let (prefix, instance, template) = match name.split_once('@') {
            Some((prefix, instance)) => (
                prefix.to_string(),
                instance.to_string(),
                Some(format!("{prefix}@.{unit_type}")),
            ),
            None => (name.to_string(), String::new(), None),
        };

        UnitNameInfo {
            full_name: self.0.clone(),
            name: name.to_string(),
            prefix,
            instance,
            template,
            unit_type: unit_type.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
