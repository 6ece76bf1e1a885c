//! Unit verbs: inventory, payload blobs and target state.

use std::collections::BTreeMap;

use flotilla_id::UnitName;
use flotilla_unit::{SchedulingOptions, TargetState, UnitFile, UnitHash};
use tracing::{debug, warn};

use super::{decode_json, decode_str, Registry};
use crate::keys::ParsedKey;
use crate::kv::{Condition, KvEntry, PutOptions};
use crate::model::UnitObject;
use crate::pagination::Page;
use crate::{RegistryError, RegistryResult, Unit};

impl Registry {
    /// All units, sorted by name.
    ///
    /// Units whose payload is missing or does not match its hash are
    /// skipped with a warning.
    pub async fn units(&self) -> RegistryResult<Vec<Unit>> {
        let dir = self.keys.units_dir();
        let entries = self.call("units", || self.store.list(&dir)).await?;

        let mut objects: BTreeMap<UnitName, UnitObject> = BTreeMap::new();
        let mut targets: BTreeMap<UnitName, TargetState> = BTreeMap::new();
        for entry in &entries {
            match self.keys.parse(&entry.key) {
                Some(ParsedKey::UnitObject(name)) => match decode_json::<UnitObject>(&entry.key, &entry.value) {
                    Ok(object) => {
                        objects.insert(name, object);
                    }
                    Err(e) => warn!(key = %entry.key, error = %e, "Skipping unreadable unit object"),
                },
                Some(ParsedKey::UnitTargetState(name)) => {
                    targets.insert(name, parse_target_state(entry));
                }
                _ => {}
            }
        }

        let mut units = Vec::with_capacity(objects.len());
        for (name, object) in objects {
            let target_state = targets.get(&name).copied().unwrap_or_default();
            match self.load_unit(object, target_state).await {
                Ok(unit) => units.push(unit),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => warn!(unit = %name, error = %e, "Skipping unit with unusable payload"),
            }
        }
        Ok(units)
    }

    /// One unit by name.
    pub async fn unit(&self, name: &UnitName) -> RegistryResult<Option<Unit>> {
        let object_key = self.keys.unit_object(name);
        let Some(entry) = self.call("unit", || self.store.get(&object_key)).await? else {
            return Ok(None);
        };
        let object: UnitObject = decode_json(&entry.key, &entry.value)?;

        let state_key = self.keys.unit_target_state(name);
        let target_state = self
            .call("unit_target_state", || self.store.get(&state_key))
            .await?
            .map(|e| parse_target_state(&e))
            .unwrap_or_default();

        self.load_unit(object, target_state).await.map(Some)
    }

    /// Create a unit. Fails with `AlreadyExists` if the name is taken and
    /// with `InvalidInput` if its scheduling options do not validate.
    pub async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        SchedulingOptions::from_unit(&unit.name, &unit.file)?;
        if unit.file.hash() != unit.hash {
            return Err(RegistryError::InvalidInput(format!(
                "unit {} hash does not match its body",
                unit.name
            )));
        }

        self.store_blob(&unit.hash, unit.payload()).await?;

        let object = serde_json::to_vec(&UnitObject {
            name: unit.name.clone(),
            hash: unit.hash.clone(),
        })?;
        let object_key = self.keys.unit_object(&unit.name);
        let created = self.call_once("create_unit", || {
            self.store.put(
                &object_key,
                object.clone(),
                PutOptions::when(Condition::MustNotExist),
            )
        })
        .await
        .map_err(|e| match e {
            RegistryError::AlreadyExists(_) => {
                RegistryError::AlreadyExists(format!("unit {} already exists", unit.name))
            }
            other => other,
        })?;

        // The object alone reads as an inactive unit, so a failed target
        // state write takes the object back out.
        let state_key = self.keys.unit_target_state(&unit.name);
        let state = unit.target_state.as_str().as_bytes().to_vec();
        if let Err(e) = self
            .call("set_unit_target_state", || {
                self.store.put(&state_key, state.clone(), PutOptions::default())
            })
            .await
        {
            self.rollback_unit_object(&unit.name, created.modified_index).await;
            return Err(e);
        }

        debug!(unit = %unit.name, hash = %unit.hash.short(), "Created unit");
        Ok(())
    }

    async fn rollback_unit_object(&self, name: &UnitName, index: u64) {
        let object_key = self.keys.unit_object(name);
        let removed = self
            .call("rollback_create_unit", || {
                self.store.delete(&object_key, Condition::PrevIndex(index))
            })
            .await;
        match removed {
            Ok(_) => debug!(unit = %name, "Rolled back partially created unit"),
            Err(e) => warn!(unit = %name, error = %e, "Failed to roll back partially created unit"),
        }
    }

    /// Remove a unit and its schedule. Destroying an absent unit succeeds.
    pub async fn destroy_unit(&self, name: &UnitName) -> RegistryResult<()> {
        let dir = self.keys.unit_dir(name);
        let removed = self.call("destroy_unit", || self.store.delete_prefix(&dir)).await?;
        if removed > 0 {
            debug!(unit = %name, keys = removed, "Destroyed unit");
        }
        Ok(())
    }

    /// Set the desired state of an existing unit.
    pub async fn set_unit_target_state(&self, name: &UnitName, state: TargetState) -> RegistryResult<()> {
        let object_key = self.keys.unit_object(name);
        if self.call("unit_exists", || self.store.get(&object_key)).await?.is_none() {
            return Err(RegistryError::NotFound(format!("unit {name}")));
        }

        let key = self.keys.unit_target_state(name);
        let value = state.as_str().as_bytes().to_vec();
        self.call("set_unit_target_state", || {
            self.store.put(&key, value.clone(), PutOptions::default())
        })
        .await?;
        Ok(())
    }

    /// Raw payload stored under `hash`.
    pub async fn unit_blob(&self, hash: &UnitHash) -> RegistryResult<Option<Vec<u8>>> {
        let key = self.keys.blob(hash);
        Ok(self
            .call("unit_blob", || self.store.get(&key))
            .await?
            .map(|e| e.value))
    }

    /// One page of units. `token` of `None` requests the first page.
    pub async fn units_page(&self, token: Option<&str>) -> RegistryResult<Page<Unit>> {
        let token = self.page_token(token)?;
        Ok(token.extract(self.units().await?))
    }

    async fn store_blob(&self, hash: &UnitHash, payload: Vec<u8>) -> RegistryResult<()> {
        let key = self.keys.blob(hash);
        let created = self
            .call_once("store_blob", || {
                self.store.put(&key, payload.clone(), PutOptions::when(Condition::MustNotExist))
            })
            .await;
        match created {
            Ok(_) => Ok(()),
            // Blobs are never overwritten; an existing one must match.
            Err(RegistryError::AlreadyExists(_)) => match self.unit_blob(hash).await? {
                Some(existing) if UnitHash::of_bytes(&existing) == *hash => Ok(()),
                Some(_) => Err(RegistryError::Corrupt(format!("blob {hash} does not match its hash"))),
                None => Err(RegistryError::PreconditionFailed(format!("blob {hash} vanished"))),
            },
            Err(e) => Err(e),
        }
    }

    async fn load_unit(&self, object: UnitObject, target_state: TargetState) -> RegistryResult<Unit> {
        let payload = self
            .unit_blob(&object.hash)
            .await?
            .ok_or_else(|| RegistryError::Corrupt(format!("payload {} missing", object.hash)))?;
        if UnitHash::of_bytes(&payload) != object.hash {
            return Err(RegistryError::Corrupt(format!(
                "payload of {} does not match hash {}",
                object.name, object.hash
            )));
        }
        let file = UnitFile::from_bytes(&payload)
            .map_err(|e| RegistryError::Corrupt(format!("payload of {}: {e}", object.name)))?;

        Ok(Unit {
            name: object.name,
            file,
            hash: object.hash,
            target_state,
        })
    }
}

fn parse_target_state(entry: &KvEntry) -> TargetState {
    match decode_str(&entry.key, &entry.value).map(str::parse::<TargetState>) {
        Ok(Ok(state)) => state,
        _ => {
            warn!(key = %entry.key, "Unreadable target state, treating as inactive");
            TargetState::Inactive
        }
    }
}
