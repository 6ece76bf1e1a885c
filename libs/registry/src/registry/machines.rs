//! Machine verbs: published machine records and dynamic metadata.

use std::collections::BTreeMap;
use std::time::Duration;

use flotilla_id::MachineId;
use tracing::{debug, warn};

use super::{decode_json, decode_str, Registry};
use crate::keys::ParsedKey;
use crate::kv::{Condition, PutOptions};
use crate::pagination::Page;
use crate::{MachineState, RegistryError, RegistryResult};

impl Registry {
    /// All live machines, sorted by id, with dynamic metadata merged in.
    pub async fn machines(&self) -> RegistryResult<Vec<MachineState>> {
        let dir = self.keys.machines_dir();
        let entries = self.call("machines", || self.store.list(&dir)).await?;

        let mut machines: BTreeMap<MachineId, MachineState> = BTreeMap::new();
        let mut dynamic: BTreeMap<MachineId, BTreeMap<String, String>> = BTreeMap::new();
        for entry in &entries {
            match self.keys.parse(&entry.key) {
                Some(ParsedKey::MachineObject(id)) => {
                    match decode_json::<MachineState>(&entry.key, &entry.value) {
                        Ok(state) if state.id == id => {
                            machines.insert(id, state);
                        }
                        Ok(state) => warn!(key = %entry.key, published = %state.id, "Machine record names another machine"),
                        Err(e) => warn!(key = %entry.key, error = %e, "Skipping unreadable machine record"),
                    }
                }
                Some(ParsedKey::MachineMetadata(id, key)) => {
                    if let Ok(value) = decode_str(&entry.key, &entry.value) {
                        dynamic.entry(id).or_default().insert(key, value.to_string());
                    }
                }
                _ => {}
            }
        }

        for (id, overrides) in dynamic {
            if let Some(machine) = machines.get_mut(&id) {
                merge_metadata(&mut machine.metadata, overrides);
            }
        }
        Ok(machines.into_values().collect())
    }

    /// One live machine by id.
    pub async fn machine(&self, id: &MachineId) -> RegistryResult<Option<MachineState>> {
        Ok(self.machines().await?.into_iter().find(|m| &m.id == id))
    }

    /// Publish a machine record with a TTL; returns the new modification
    /// index of the record.
    pub async fn set_machine_state(&self, machine: &MachineState, ttl: Duration) -> RegistryResult<u64> {
        let key = self.keys.machine_object(&machine.id);
        let value = serde_json::to_vec(machine)?;

        let updated = self
            .call("set_machine_state", || {
                self.store.put(
                    &key,
                    value.clone(),
                    PutOptions::when(Condition::MustExist).with_ttl(ttl),
                )
            })
            .await;
        let entry = match updated {
            Ok(entry) => entry,
            Err(RegistryError::NotFound(_)) => {
                let entry = self
                    .call("set_machine_state", || {
                        self.store.put(
                            &key,
                            value.clone(),
                            PutOptions::when(Condition::MustNotExist).with_ttl(ttl),
                        )
                    })
                    .await?;
                debug!(machine = %machine.id, "Published new machine record");
                entry
            }
            Err(e) => return Err(e),
        };
        Ok(entry.modified_index)
    }

    /// Remove a machine record. Removing an absent record succeeds.
    pub async fn remove_machine_state(&self, id: &MachineId) -> RegistryResult<()> {
        let key = self.keys.machine_object(id);
        match self
            .call("remove_machine_state", || self.store.delete(&key, Condition::None))
            .await
        {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Set one dynamic metadata key. An empty value hides the published key.
    pub async fn set_machine_metadata(&self, id: &MachineId, key: &str, value: &str) -> RegistryResult<()> {
        validate_metadata_key(key)?;
        let kv_key = self.keys.machine_metadata(id, key);
        let value = value.as_bytes().to_vec();
        self.call("set_machine_metadata", || {
            self.store.put(&kv_key, value.clone(), PutOptions::default())
        })
        .await?;
        Ok(())
    }

    /// Remove one dynamic metadata key. Removing an absent key succeeds.
    pub async fn delete_machine_metadata(&self, id: &MachineId, key: &str) -> RegistryResult<()> {
        validate_metadata_key(key)?;
        let kv_key = self.keys.machine_metadata(id, key);
        match self
            .call("delete_machine_metadata", || self.store.delete(&kv_key, Condition::None))
            .await
        {
            Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// One page of machines.
    pub async fn machines_page(&self, token: Option<&str>) -> RegistryResult<Page<MachineState>> {
        let token = self.page_token(token)?;
        Ok(token.extract(self.machines().await?))
    }
}

fn merge_metadata(published: &mut BTreeMap<String, String>, overrides: BTreeMap<String, String>) {
    for (key, value) in overrides {
        if value.is_empty() {
            published.remove(&key);
        } else {
            published.insert(key, value);
        }
    }
}

fn validate_metadata_key(key: &str) -> RegistryResult<()> {
    if key.is_empty() || key.contains('/') {
        return Err(RegistryError::InvalidInput(format!(
            "invalid metadata key {key:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_support::{machine, registry};
    use crate::MachineState;

    fn state(id: &str) -> MachineState {
        let mut state = MachineState::new(machine(id));
        state.metadata.insert("region".to_string(), "us-east".to_string());
        state.metadata.insert("disk".to_string(), "ssd".to_string());
        state
    }

    #[tokio::test]
    async fn test_publish_and_list() {
        let (_, registry) = registry();
        let first = registry.set_machine_state(&state("m2"), Duration::from_secs(30)).await.unwrap();
        let second = registry.set_machine_state(&state("m1"), Duration::from_secs(30)).await.unwrap();
        let third = registry.set_machine_state(&state("m1"), Duration::from_secs(30)).await.unwrap();
        assert!(first < second && second < third);

        let machines = registry.machines().await.unwrap();
        let ids: Vec<_> = machines.iter().map(|m| m.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_expires_with_ttl() {
        let (_, registry) = registry();
        registry.set_machine_state(&state("m1"), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(registry.machines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_, registry) = registry();
        registry.set_machine_state(&state("m1"), Duration::from_secs(30)).await.unwrap();
        registry.remove_machine_state(&machine("m1")).await.unwrap();
        registry.remove_machine_state(&machine("m1")).await.unwrap();
        assert!(registry.machine(&machine("m1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dynamic_metadata_overrides() {
        let (_, registry) = registry();
        let id = machine("m1");
        registry.set_machine_state(&state("m1"), Duration::from_secs(30)).await.unwrap();
        registry.set_machine_metadata(&id, "region", "eu-west").await.unwrap();
        registry.set_machine_metadata(&id, "disk", "").await.unwrap();
        registry.set_machine_metadata(&id, "rack", "r7").await.unwrap();

        let m = registry.machine(&id).await.unwrap().unwrap();
        assert_eq!(m.metadata.get("region").map(String::as_str), Some("eu-west"));
        assert_eq!(m.metadata.get("rack").map(String::as_str), Some("r7"));
        assert!(!m.metadata.contains_key("disk"));

        registry.delete_machine_metadata(&id, "region").await.unwrap();
        registry.delete_machine_metadata(&id, "region").await.unwrap();
        let m = registry.machine(&id).await.unwrap().unwrap();
        assert_eq!(m.metadata.get("region").map(String::as_str), Some("us-east"));

        assert!(registry.set_machine_metadata(&id, "a/b", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_metadata_without_record_is_not_a_machine() {
        let (_, registry) = registry();
        registry.set_machine_metadata(&machine("ghost"), "region", "x").await.unwrap();
        assert!(registry.machines().await.unwrap().is_empty());
    }
}
