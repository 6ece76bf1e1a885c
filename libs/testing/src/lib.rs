//! # flotilla-testing
//!
//! Fixtures shared by unit tests and cluster scenarios: unit and machine
//! builders, and a registry over a fresh in-memory store.
//!
//! Builders panic on invalid input; they are only meant for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use flotilla_id::{MachineId, UnitName};
use flotilla_registry::{MachineState, MemoryStore, Registry, RegistryConfig, Unit};
use flotilla_unit::{ResourceTuple, TargetState, UnitFile, FLEET_SECTION};

// =============================================================================
// Identifiers
// =============================================================================

pub fn unit_name(name: &str) -> UnitName {
    name.parse()
        .unwrap_or_else(|e| panic!("invalid unit name {name:?}: {e}"))
}

pub fn machine_id(id: &str) -> MachineId {
    id.parse()
        .unwrap_or_else(|e| panic!("invalid machine id {id:?}: {e}"))
}

// =============================================================================
// Units
// =============================================================================

/// Builds a [`Unit`] with a `[Service]` body and `[X-Fleet]` options.
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    name: String,
    target: TargetState,
    exec: String,
    fleet: Vec<(String, String)>,
}

impl UnitBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            target: TargetState::Launched,
            exec: "/usr/bin/sleep infinity".to_string(),
            fleet: Vec::new(),
        }
    }

    pub fn target(mut self, target: TargetState) -> Self {
        self.target = target;
        self
    }

    /// Change the body, and therefore the hash.
    pub fn exec(mut self, exec: &str) -> Self {
        self.exec = exec.to_string();
        self
    }

    pub fn pin(self, machine: &str) -> Self {
        self.option("MachineID", machine)
    }

    pub fn machine_of(self, peer: &str) -> Self {
        self.option("MachineOf", peer)
    }

    pub fn conflicts(self, pattern: &str) -> Self {
        self.option("Conflicts", pattern)
    }

    pub fn metadata(self, key: &str, value: &str) -> Self {
        self.option("MachineMetadata", &format!("{key}={value}"))
    }

    pub fn global(self) -> Self {
        self.option("Global", "true")
    }

    pub fn resources(self, cores: u32, memory_mb: u64, disk_mb: u64) -> Self {
        self.option("Cores", &cores.to_string())
            .option("MemoryMB", &memory_mb.to_string())
            .option("DiskMB", &disk_mb.to_string())
    }

    /// Any `[X-Fleet]` option, verbatim.
    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.fleet.push((key.to_string(), value.to_string()));
        self
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "[Unit]\nDescription={}\n\n[Service]\nExecStart={}\n",
            self.name, self.exec
        );
        if !self.fleet.is_empty() {
            body.push_str(&format!("\n[{FLEET_SECTION}]\n"));
            for (key, value) in &self.fleet {
                body.push_str(&format!("{key}={value}\n"));
            }
        }
        body
    }

    pub fn build(self) -> Unit {
        let file = UnitFile::parse(&self.body())
            .unwrap_or_else(|e| panic!("fixture unit {} does not parse: {e}", self.name));
        Unit::new(unit_name(&self.name), file, self.target)
    }
}

/// A plain launched unit.
pub fn launched(name: &str) -> Unit {
    UnitBuilder::new(name).build()
}

// =============================================================================
// Machines
// =============================================================================

/// Builds a [`MachineState`].
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    state: MachineState,
}

impl MachineBuilder {
    pub fn new(id: &str) -> Self {
        let mut state = MachineState::new(machine_id(id));
        state.public_ip = "10.0.0.1".to_string();
        Self { state }
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.state.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn capability(mut self, capability: &str) -> Self {
        self.state.capabilities.insert(capability.to_string());
        self
    }

    /// Total and free resources, equal.
    pub fn resources(mut self, cores: u32, memory_mb: u64, disk_mb: u64) -> Self {
        let tuple = ResourceTuple::new(cores, memory_mb, disk_mb);
        self.state.total_resources = tuple;
        self.state.free_resources = tuple;
        self
    }

    pub fn free(mut self, cores: u32, memory_mb: u64, disk_mb: u64) -> Self {
        self.state.free_resources = ResourceTuple::new(cores, memory_mb, disk_mb);
        self
    }

    pub fn loaded_units(mut self, count: u32) -> Self {
        self.state.loaded_units = count;
        self
    }

    pub fn build(self) -> MachineState {
        self.state
    }
}

pub fn machine(id: &str) -> MachineState {
    MachineBuilder::new(id).build()
}

/// Metadata map from `k=v` pairs.
pub fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Registry
// =============================================================================

/// A registry over a fresh in-memory store, with the store handle.
pub fn memory_registry() -> (Arc<MemoryStore>, Registry) {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), RegistryConfig::default());
    (store, registry)
}

/// Install a test subscriber once per process; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
