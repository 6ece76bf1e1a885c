//! Local supervisor interface and mock implementation.
//!
//! The supervisor owns unit lifecycles on one machine:
//! - loading and unloading unit files
//! - starting and stopping loaded units
//! - listing what is loaded
//!
//! Every operation is idempotent. A mock implementation is provided for
//! testing and development.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use flotilla_id::UnitName;
use flotilla_unit::UnitHash;
use thiserror::Error;
use tracing::{debug, info};

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("unit {0} is not loaded")]
    NotLoaded(UnitName),

    #[error("unit {unit}: {reason}")]
    Failed { unit: UnitName, reason: String },

    #[error("supervisor unavailable: {0}")]
    Unavailable(String),
}

/// What the supervisor reports about one loaded unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: UnitName,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    /// Hash of the loaded file, when the supervisor tracks it.
    pub hash: Option<UnitHash>,
}

impl UnitStatus {
    pub fn is_running(&self) -> bool {
        matches!(self.active_state.as_str(), "active" | "activating" | "reloading")
    }
}

/// Local supervisor interface.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Install a unit file and make it known to the supervisor.
    async fn load(&self, name: &UnitName, body: &[u8]) -> SupervisorResult<()>;

    async fn start(&self, name: &UnitName) -> SupervisorResult<()>;

    async fn stop(&self, name: &UnitName) -> SupervisorResult<()>;

    /// Stop if needed and forget a unit. Unloading an unknown unit succeeds.
    async fn unload(&self, name: &UnitName) -> SupervisorResult<()>;

    /// Loaded units, sorted by name.
    async fn list(&self) -> SupervisorResult<Vec<UnitStatus>>;
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Clone)]
struct MockUnit {
    hash: UnitHash,
    running: bool,
}

/// In-memory supervisor for testing and development.
#[derive(Debug, Default)]
pub struct MockSupervisor {
    units: Mutex<BTreeMap<UnitName, MockUnit>>,
    /// Fail every operation.
    fail_all: bool,
    /// Fail operations on these units only.
    failing_units: Mutex<BTreeSet<UnitName>>,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A supervisor whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Make operations on `name` fail until [`MockSupervisor::heal_unit`].
    pub fn fail_unit(&self, name: &UnitName) {
        lock(&self.failing_units).insert(name.clone());
    }

    pub fn heal_unit(&self, name: &UnitName) {
        lock(&self.failing_units).remove(name);
    }

    /// Simulate a unit exiting on its own.
    pub fn crash(&self, name: &UnitName) {
        if let Some(unit) = lock(&self.units).get_mut(name) {
            unit.running = false;
        }
    }

    pub fn is_loaded(&self, name: &UnitName) -> bool {
        lock(&self.units).contains_key(name)
    }

    pub fn is_running(&self, name: &UnitName) -> bool {
        lock(&self.units).get(name).is_some_and(|u| u.running)
    }

    pub fn loaded_hash(&self, name: &UnitName) -> Option<UnitHash> {
        lock(&self.units).get(name).map(|u| u.hash.clone())
    }

    fn check(&self, name: Option<&UnitName>) -> SupervisorResult<()> {
        if self.fail_all {
            return Err(SupervisorError::Unavailable(
                "mock supervisor configured to fail".to_string(),
            ));
        }
        if let Some(name) = name {
            if lock(&self.failing_units).contains(name) {
                return Err(SupervisorError::Failed {
                    unit: name.clone(),
                    reason: "mock unit configured to fail".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn load(&self, name: &UnitName, body: &[u8]) -> SupervisorResult<()> {
        self.check(Some(name))?;
        let hash = UnitHash::of_bytes(body);
        info!(unit = %name, hash = %hash.short(), "[MOCK] Loading unit");
        let mut units = lock(&self.units);
        let running = units.get(name).is_some_and(|u| u.hash == hash && u.running);
        units.insert(name.clone(), MockUnit { hash, running });
        Ok(())
    }

    async fn start(&self, name: &UnitName) -> SupervisorResult<()> {
        self.check(Some(name))?;
        info!(unit = %name, "[MOCK] Starting unit");
        match lock(&self.units).get_mut(name) {
            Some(unit) => {
                unit.running = true;
                Ok(())
            }
            None => Err(SupervisorError::NotLoaded(name.clone())),
        }
    }

    async fn stop(&self, name: &UnitName) -> SupervisorResult<()> {
        self.check(Some(name))?;
        info!(unit = %name, "[MOCK] Stopping unit");
        if let Some(unit) = lock(&self.units).get_mut(name) {
            unit.running = false;
        }
        Ok(())
    }

    async fn unload(&self, name: &UnitName) -> SupervisorResult<()> {
        self.check(Some(name))?;
        info!(unit = %name, "[MOCK] Unloading unit");
        lock(&self.units).remove(name);
        Ok(())
    }

    async fn list(&self) -> SupervisorResult<Vec<UnitStatus>> {
        self.check(None)?;
        let units = lock(&self.units);
        debug!(count = units.len(), "[MOCK] Listing units");
        Ok(units
            .iter()
            .map(|(name, unit)| {
                let (active, sub) = if unit.running {
                    ("active", "running")
                } else {
                    ("inactive", "dead")
                };
                UnitStatus {
                    name: name.clone(),
                    load_state: "loaded".to_string(),
                    active_state: active.to_string(),
                    sub_state: sub.to_string(),
                    hash: Some(unit.hash.clone()),
                }
            })
            .collect())
    }
}
