//! Lease-based leadership over the registry lease verbs.
//!
//! A lease carries the engine protocol version of its holder. A holder with
//! a newer version may steal the lease from an older one, fenced by the
//! lease's modification index, and then waits out the victim's remaining
//! time before acting.

use std::time::Duration;

use flotilla_id::MachineId;
use flotilla_registry::{Lease, Registry, RegistryError, RegistryResult};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Name of the engine leadership lease.
pub const ENGINE_LEASE_NAME: &str = "engine-leader";

/// Times the acquisition algorithm restarts after losing a race.
const MAX_ACQUIRE_ROUNDS: usize = 3;

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leadership {
    Leader(Lease),
    /// Someone else holds the lease, or nobody could be observed holding it.
    Follower(Option<Lease>),
}

impl Leadership {
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Leader(lease) => Some(lease),
            Self::Follower(lease) => lease.as_ref(),
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }
}

/// Acquires, renews and releases one named lease on behalf of a machine.
#[derive(Clone)]
pub struct LeaseManager {
    registry: Registry,
    name: String,
    machine: MachineId,
    version: u32,
}

impl LeaseManager {
    pub fn new(registry: Registry, name: impl Into<String>, machine: MachineId, version: u32) -> Self {
        Self {
            registry,
            name: name.into(),
            machine,
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Try to become (or stay) the holder of the lease.
    pub async fn acquire(&self, ttl: Duration) -> RegistryResult<Leadership> {
        let mut observed = None;
        for _ in 0..MAX_ACQUIRE_ROUNDS {
            match self.acquire_round(ttl).await? {
                Round::Done(leadership) => return Ok(leadership),
                Round::Raced(lease) => {
                    debug!(lease = %self.name, "Lost a lease race, retrying");
                    observed = lease;
                }
            }
        }
        Ok(Leadership::Follower(observed))
    }

    async fn acquire_round(&self, ttl: Duration) -> RegistryResult<Round> {
        let Some(existing) = self.registry.get_lease(&self.name).await? else {
            return self.try_acquire(ttl, None).await;
        };

        if existing.is_held_by(&self.machine) {
            return match self.registry.renew(&existing, ttl).await {
                Ok(lease) => Ok(Round::Done(Leadership::Leader(lease))),
                Err(RegistryError::NotFound(_)) => self.try_acquire(ttl, None).await,
                Err(RegistryError::PreconditionFailed(_)) => Ok(Round::Raced(Some(existing))),
                Err(e) => Err(e),
            };
        }

        if existing.version >= self.version {
            return Ok(Round::Done(Leadership::Follower(Some(existing))));
        }

        let remaining = existing.remaining(Instant::now());
        let stolen = self
            .registry
            .steal_lease(
                &self.name,
                &self.machine,
                self.version,
                ttl + remaining,
                existing.index,
            )
            .await;
        match stolen {
            Ok(lease) => {
                info!(
                    lease = %self.name,
                    previous_holder = %existing.holder,
                    previous_version = existing.version,
                    version = self.version,
                    wait_ms = remaining.as_millis() as u64,
                    "Stole lease from older holder"
                );
                tokio::time::sleep(remaining).await;
                Ok(Round::Done(Leadership::Leader(lease)))
            }
            Err(RegistryError::PreconditionFailed(_)) => Ok(Round::Raced(Some(existing))),
            Err(e) => Err(e),
        }
    }

    async fn try_acquire(&self, ttl: Duration, observed: Option<Lease>) -> RegistryResult<Round> {
        match self
            .registry
            .acquire_lease(&self.name, &self.machine, self.version, ttl)
            .await
        {
            Ok(lease) => {
                info!(lease = %self.name, machine = %self.machine, version = self.version, "Acquired lease");
                Ok(Round::Done(Leadership::Leader(lease)))
            }
            Err(RegistryError::AlreadyExists(_)) => Ok(Round::Raced(observed)),
            Err(e) => Err(e),
        }
    }

    /// Extend a held lease. Returns `None` if the lease was lost.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> RegistryResult<Option<Lease>> {
        match self.registry.renew(lease, ttl).await {
            Ok(lease) => Ok(Some(lease)),
            Err(RegistryError::NotFound(_) | RegistryError::PreconditionFailed(_)) => {
                warn!(lease = %self.name, machine = %self.machine, "Lease lost");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn release(&self, lease: &Lease) -> RegistryResult<()> {
        self.registry.release(lease).await?;
        info!(lease = %self.name, machine = %self.machine, "Released lease");
        Ok(())
    }
}

enum Round {
    Done(Leadership),
    Raced(Option<Lease>),
}
