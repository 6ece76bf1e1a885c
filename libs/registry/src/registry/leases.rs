//! Lease verbs and the engine version.
//!
//! Every lease mutation after acquisition is fenced by the modification
//! index observed by the caller.

use std::time::Duration;

use flotilla_id::MachineId;
use tracing::debug;

use super::{decode_json, decode_str, Registry};
use crate::kv::{Condition, KvEntry, PutOptions};
use crate::model::LeaseValue;
use crate::{Lease, RegistryError, RegistryResult};

impl Registry {
    pub async fn get_lease(&self, name: &str) -> RegistryResult<Option<Lease>> {
        let key = self.keys.lease(name);
        match self.call("get_lease", || self.store.get(&key)).await? {
            Some(entry) => Ok(Some(lease_from_entry(name, &entry)?)),
            None => Ok(None),
        }
    }

    /// Claim a free lease. Fails with `AlreadyExists` if anyone holds it.
    pub async fn acquire_lease(
        &self,
        name: &str,
        holder: &MachineId,
        version: u32,
        ttl: Duration,
    ) -> RegistryResult<Lease> {
        let key = self.keys.lease(name);
        let value = lease_value(holder, version)?;
        let entry = self
            .call_once("acquire_lease", || {
                self.store.put(
                    &key,
                    value.clone(),
                    PutOptions::when(Condition::MustNotExist).with_ttl(ttl),
                )
            })
            .await?;
        debug!(lease = name, holder = %holder, version, index = entry.modified_index, "Acquired lease");
        lease_from_entry(name, &entry)
    }

    /// Take over a lease held by someone else. Succeeds only if the lease
    /// still carries `expected_index`.
    pub async fn steal_lease(
        &self,
        name: &str,
        holder: &MachineId,
        version: u32,
        ttl: Duration,
        expected_index: u64,
    ) -> RegistryResult<Lease> {
        let key = self.keys.lease(name);
        let value = lease_value(holder, version)?;
        let entry = self
            .call_once("steal_lease", || {
                self.store.put(
                    &key,
                    value.clone(),
                    PutOptions::when(Condition::PrevIndex(expected_index)).with_ttl(ttl),
                )
            })
            .await
            .map_err(|e| match e {
                RegistryError::NotFound(_) => {
                    RegistryError::PreconditionFailed(format!("lease {name} vanished"))
                }
                other => other,
            })?;
        debug!(lease = name, holder = %holder, version, index = entry.modified_index, "Stole lease");
        lease_from_entry(name, &entry)
    }

    /// Extend a held lease. Fails with `NotFound` if it expired and with
    /// `PreconditionFailed` if someone else changed it.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> RegistryResult<Lease> {
        let key = self.keys.lease(&lease.name);
        let value = lease_value(&lease.holder, lease.version)?;
        let entry = self
            .call_once("renew_lease", || {
                self.store.put(
                    &key,
                    value.clone(),
                    PutOptions::when(Condition::PrevIndex(lease.index)).with_ttl(ttl),
                )
            })
            .await?;
        lease_from_entry(&lease.name, &entry)
    }

    /// Give up a held lease. Releasing an expired lease succeeds.
    pub async fn release(&self, lease: &Lease) -> RegistryResult<()> {
        let key = self.keys.lease(&lease.name);
        match self
            .call_once("release_lease", || {
                self.store.delete(&key, Condition::PrevIndex(lease.index))
            })
            .await
        {
            Ok(_) | Err(RegistryError::NotFound(_)) => {
                debug!(lease = %lease.name, holder = %lease.holder, "Released lease");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Engine protocol version the cluster speaks; 0 if never set.
    pub async fn engine_version(&self) -> RegistryResult<u32> {
        let key = self.keys.engine_version();
        match self.call("engine_version", || self.store.get(&key)).await? {
            Some(entry) => parse_version(&entry),
            None => Ok(0),
        }
    }

    /// Move the engine version from `from` to `to`. Fails with
    /// `PreconditionFailed` if the stored version is not `from`.
    pub async fn update_engine_version(&self, from: u32, to: u32) -> RegistryResult<()> {
        if to < from {
            return Err(RegistryError::InvalidInput(format!(
                "engine version may not go backwards ({from} -> {to})"
            )));
        }
        let key = self.keys.engine_version();
        let value = to.to_string().into_bytes();
        let condition = if from == 0 {
            Condition::MustNotExist
        } else {
            Condition::PrevValue(from.to_string().into_bytes())
        };

        self.call_once("update_engine_version", || {
            self.store.put(&key, value.clone(), PutOptions::when(condition.clone()))
        })
        .await
        .map_err(|e| match e {
            RegistryError::AlreadyExists(_) | RegistryError::NotFound(_) => {
                RegistryError::PreconditionFailed(format!("engine version is not {from}"))
            }
            other => other,
        })?;
        debug!(from, to, "Updated engine version");
        Ok(())
    }
}

fn lease_value(holder: &MachineId, version: u32) -> RegistryResult<Vec<u8>> {
    Ok(serde_json::to_vec(&LeaseValue {
        holder: holder.clone(),
        version,
    })?)
}

fn lease_from_entry(name: &str, entry: &KvEntry) -> RegistryResult<Lease> {
    let value: LeaseValue = decode_json(&entry.key, &entry.value)?;
    Ok(Lease {
        name: name.to_string(),
        holder: value.holder,
        version: value.version,
        index: entry.modified_index,
        expires_at: entry.expires_at,
    })
}

fn parse_version(entry: &KvEntry) -> RegistryResult<u32> {
    let raw = decode_str(&entry.key, &entry.value)?;
    raw.parse()
        .map_err(|_| RegistryError::Serialization(format!("{}: invalid engine version {raw:?}", entry.key)))
}
