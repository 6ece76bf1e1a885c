//! Unit-state verbs: agent reports and unit heartbeats.

use std::time::Duration;

use flotilla_id::{MachineId, UnitName};
use flotilla_unit::UnitState;
use tracing::warn;

use super::{decode_json, Registry};
use crate::keys::ParsedKey;
use crate::kv::{Condition, PutOptions};
use crate::pagination::Page;
use crate::{RegistryError, RegistryResult};

impl Registry {
    /// Every live unit state, sorted by unit name then machine id.
    pub async fn unit_states(&self) -> RegistryResult<Vec<UnitState>> {
        let dir = self.keys.states_dir();
        let entries = self.call("unit_states", || self.store.list(&dir)).await?;

        let mut states = Vec::with_capacity(entries.len());
        for entry in &entries {
            let Some(ParsedKey::UnitState(name, machine)) = self.keys.parse(&entry.key) else {
                continue;
            };
            match decode_json::<UnitState>(&entry.key, &entry.value) {
                Ok(state) if state.unit_name == name && state.machine_id == machine => states.push(state),
                Ok(_) => warn!(key = %entry.key, "Unit state does not match its key"),
                Err(e) => warn!(key = %entry.key, error = %e, "Skipping unreadable unit state"),
            }
        }
        states.sort_by(|a, b| {
            (&a.unit_name, &a.machine_id).cmp(&(&b.unit_name, &b.machine_id))
        });
        Ok(states)
    }

    /// Publish the state of `name` as reported by `state.machine_id`.
    pub async fn save_unit_state(&self, name: &UnitName, state: &UnitState, ttl: Duration) -> RegistryResult<()> {
        if &state.unit_name != name {
            return Err(RegistryError::InvalidInput(format!(
                "unit state for {} saved under {name}",
                state.unit_name
            )));
        }
        let key = self.keys.unit_state(name, &state.machine_id);
        let value = serde_json::to_vec(state)?;
        self.call("save_unit_state", || {
            self.store.put(&key, value.clone(), PutOptions::ttl(ttl))
        })
        .await?;
        Ok(())
    }

    /// Remove every machine's state for `name`.
    pub async fn remove_unit_state(&self, name: &UnitName) -> RegistryResult<()> {
        let dir = self.keys.unit_states(name);
        self.call("remove_unit_state", || self.store.delete_prefix(&dir)).await?;
        Ok(())
    }

    /// Remove the state `machine` reported for `name`.
    pub async fn remove_machine_unit_state(&self, name: &UnitName, machine: &MachineId) -> RegistryResult<()> {
        let key = self.keys.unit_state(name, machine);
        match self
            .call("remove_machine_unit_state", || self.store.delete(&key, Condition::None))
            .await
        {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Record that `machine` is running `name`, for `ttl`.
    pub async fn unit_heartbeat(&self, name: &UnitName, machine: &MachineId, ttl: Duration) -> RegistryResult<()> {
        let key = self.keys.unit_heartbeat(name);
        let value = machine.as_str().as_bytes().to_vec();
        self.call("unit_heartbeat", || {
            self.store.put(&key, value.clone(), PutOptions::ttl(ttl))
        })
        .await?;
        Ok(())
    }

    pub async fn clear_unit_heartbeat(&self, name: &UnitName) -> RegistryResult<()> {
        let key = self.keys.unit_heartbeat(name);
        match self
            .call("clear_unit_heartbeat", || self.store.delete(&key, Condition::None))
            .await
        {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// One page of unit states.
    pub async fn unit_states_page(&self, token: Option<&str>) -> RegistryResult<Page<UnitState>> {
        let token = self.page_token(token)?;
        Ok(token.extract(self.unit_states().await?))
    }
}
