//! KV key layout.

use flotilla_id::{MachineId, UnitName};
use flotilla_unit::UnitHash;

/// Default KV prefix.
pub const DEFAULT_KEY_PREFIX: &str = "/_coreos.com/fleet/";

const UNIT: &str = "unit";
const UNIT_BLOB: &str = "unit-blob";
const MACHINES: &str = "machines";
const STATES: &str = "states";
const LEASE: &str = "lease";
const ENGINE: &str = "engine";

/// A key under the prefix, classified by entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    UnitObject(UnitName),
    UnitTargetState(UnitName),
    UnitTarget(UnitName),
    UnitHeartbeat(UnitName),
    Blob(String),
    MachineObject(MachineId),
    MachineMetadata(MachineId, String),
    UnitState(UnitName, MachineId),
    Lease(String),
    EngineVersion,
}

/// Builds and parses keys under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    /// Prefix without a trailing slash.
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        let prefix = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self { prefix }
    }

    /// Prefix covering every key, with a trailing slash.
    pub fn root(&self) -> String {
        format!("{}/", self.prefix)
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push('/');
            key.push_str(part);
        }
        key
    }

    pub fn units_dir(&self) -> String {
        self.join(&[UNIT, ""])
    }

    pub fn unit_dir(&self, name: &UnitName) -> String {
        self.join(&[UNIT, name.as_str(), ""])
    }

    pub fn unit_object(&self, name: &UnitName) -> String {
        self.join(&[UNIT, name.as_str(), "object"])
    }

    pub fn unit_target_state(&self, name: &UnitName) -> String {
        self.join(&[UNIT, name.as_str(), "target-state"])
    }

    pub fn unit_target(&self, name: &UnitName) -> String {
        self.join(&[UNIT, name.as_str(), "target"])
    }

    pub fn unit_heartbeat(&self, name: &UnitName) -> String {
        self.join(&[UNIT, name.as_str(), "heartbeat"])
    }

    pub fn blob(&self, hash: &UnitHash) -> String {
        self.join(&[UNIT_BLOB, hash.as_str()])
    }

    pub fn machines_dir(&self) -> String {
        self.join(&[MACHINES, ""])
    }

    pub fn machine_object(&self, id: &MachineId) -> String {
        self.join(&[MACHINES, id.as_str(), "object"])
    }

    pub fn machine_metadata(&self, id: &MachineId, key: &str) -> String {
        self.join(&[MACHINES, id.as_str(), "metadata", key])
    }

    pub fn states_dir(&self) -> String {
        self.join(&[STATES, ""])
    }

    pub fn unit_states(&self, name: &UnitName) -> String {
        self.join(&[STATES, name.as_str(), ""])
    }

    pub fn unit_state(&self, name: &UnitName, machine: &MachineId) -> String {
        self.join(&[STATES, name.as_str(), machine.as_str()])
    }

    pub fn lease(&self, name: &str) -> String {
        self.join(&[LEASE, name])
    }

    pub fn engine_version(&self) -> String {
        self.join(&[ENGINE, "version"])
    }

    /// Classify a full key. Keys outside the prefix or with an unknown
    /// shape yield `None`.
    pub fn parse(&self, key: &str) -> Option<ParsedKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [UNIT, name, leaf] => {
                let name = UnitName::parse(name).ok()?;
                match *leaf {
                    "object" => Some(ParsedKey::UnitObject(name)),
                    "target-state" => Some(ParsedKey::UnitTargetState(name)),
                    "target" => Some(ParsedKey::UnitTarget(name)),
                    "heartbeat" => Some(ParsedKey::UnitHeartbeat(name)),
                    _ => None,
                }
            }
            [UNIT_BLOB, hash] => Some(ParsedKey::Blob(hash.to_string())),
            [MACHINES, id, "object"] => Some(ParsedKey::MachineObject(MachineId::parse(id).ok()?)),
            [MACHINES, id, "metadata", meta] => Some(ParsedKey::MachineMetadata(
                MachineId::parse(id).ok()?,
                meta.to_string(),
            )),
            [STATES, name, id] => Some(ParsedKey::UnitState(
                UnitName::parse(name).ok()?,
                MachineId::parse(id).ok()?,
            )),
            [LEASE, name] => Some(ParsedKey::Lease(name.to_string())),
            [ENGINE, "version"] => Some(ParsedKey::EngineVersion),
            _ => None,
        }
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
