//! The cluster reconciler.
//!
//! An engine is a follower until it holds the engine lease. Each tick it
//! checks the cluster's engine version, renews or acquires the lease, and as
//! leader runs one reconcile pass: load a snapshot, calculate tasks, apply
//! them in order. The first failed task ends the pass; the next pass works
//! from a fresh snapshot.

use std::fmt;
use std::time::Duration;

use flotilla_id::{MachineId, UnitName};
use flotilla_reconcile::DEFAULT_ENGINE_RECONCILE_INTERVAL;
use flotilla_registry::{Lease, Registry};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::leadership::{LeaseManager, Leadership, ENGINE_LEASE_NAME};
use crate::reconciler::{calculate_tasks, Task, TaskKind};
use crate::scheduler::{Scheduler, DEFAULT_CANDIDATE_POOL};
use crate::snapshot::ClusterSnapshot;

/// Engine protocol version this build speaks.
pub const ENGINE_VERSION: u32 = 1;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Periodic reconcile tick.
    pub reconcile_interval: Duration,
    /// TTL of the leadership lease.
    pub lease_ttl: Duration,
    /// Least-loaded machines considered per placement.
    pub candidate_pool: usize,
    /// Protocol version advertised in the lease and the engine version key.
    pub version: u32,
}

impl EngineConfig {
    /// Configuration for a given tick; the lease lives five ticks.
    pub fn with_interval(reconcile_interval: Duration) -> Self {
        Self {
            reconcile_interval,
            lease_ttl: reconcile_interval * 5,
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            version: ENGINE_VERSION,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_interval(DEFAULT_ENGINE_RECONCILE_INTERVAL)
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => f.write_str("follower"),
            Self::Leader => f.write_str("leader"),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub role: Role,
    pub scheduled: usize,
    pub unscheduled: usize,
    /// Units that should run but could not be placed.
    pub deferred: Vec<(UnitName, String)>,
    /// Tasks that failed; a failure ends the pass.
    pub failed: usize,
}

impl EngineStats {
    pub fn changed(&self) -> bool {
        self.scheduled > 0 || self.unscheduled > 0 || self.failed > 0
    }
}

pub struct Engine {
    registry: Registry,
    leases: LeaseManager,
    scheduler: Scheduler,
    config: EngineConfig,
    lease: Option<Lease>,
}

impl Engine {
    pub fn new(registry: Registry, machine: MachineId, config: EngineConfig) -> Self {
        let leases = LeaseManager::new(registry.clone(), ENGINE_LEASE_NAME, machine, config.version);
        Self {
            registry,
            leases,
            scheduler: Scheduler::new(config.candidate_pool),
            config,
            lease: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn machine(&self) -> &MachineId {
        self.leases.machine()
    }

    pub fn role(&self) -> Role {
        if self.lease.is_some() {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    /// Run one tick: settle leadership and, as leader, reconcile.
    ///
    /// `cancel` is checked between steps; once it reads `true` the pass
    /// stops with [`EngineError::Cancelled`].
    #[instrument(skip(self, cancel), fields(machine = %self.leases.machine()))]
    pub async fn tick(&mut self, cancel: &watch::Receiver<bool>) -> EngineResult<EngineStats> {
        let started = Instant::now();
        let ours = self.config.version;

        let cluster_version = self.registry.engine_version().await?;
        if cluster_version > ours {
            warn!(cluster_version, version = ours, "Cluster runs a newer engine, not participating");
            self.demote().await;
            return Ok(EngineStats::default());
        }

        if !self.settle_leadership().await? {
            return Ok(EngineStats::default());
        }

        if cluster_version < ours {
            match self.registry.update_engine_version(cluster_version, ours).await {
                Ok(()) => info!(from = cluster_version, to = ours, "Updated cluster engine version"),
                Err(e) if e.is_precondition_failed() => {
                    warn!(error = %e, "Engine version changed underneath us, skipping pass");
                    return Ok(EngineStats {
                        role: Role::Leader,
                        ..EngineStats::default()
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let stats = self.reconcile(cancel).await?;

        let elapsed = started.elapsed();
        if elapsed > self.config.reconcile_interval {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.config.reconcile_interval.as_millis() as u64,
                "Reconcile pass took longer than the reconcile interval"
            );
        }
        Ok(stats)
    }

    /// Renew or acquire the lease. Returns true while leader.
    async fn settle_leadership(&mut self) -> EngineResult<bool> {
        let ttl = self.config.lease_ttl;
        if let Some(current) = &self.lease {
            return match self.leases.renew(current, ttl).await? {
                Some(renewed) => {
                    self.lease = Some(renewed);
                    Ok(true)
                }
                None => {
                    self.lease = None;
                    Err(EngineError::LeaseLost)
                }
            };
        }

        match self.leases.acquire(ttl).await? {
            Leadership::Leader(lease) => {
                info!(index = lease.index, "Became engine leader");
                self.lease = Some(lease);
                Ok(true)
            }
            Leadership::Follower(holder) => {
                debug!(
                    holder = holder.as_ref().map(|l| l.holder.to_string()).unwrap_or_default(),
                    "Engine lease held elsewhere"
                );
                Ok(false)
            }
        }
    }

    async fn reconcile(&mut self, cancel: &watch::Receiver<bool>) -> EngineResult<EngineStats> {
        check_cancel(cancel)?;
        let snapshot = ClusterSnapshot::load(&self.registry).await?;
        let plan = calculate_tasks(&snapshot, &self.scheduler);

        let mut stats = EngineStats {
            role: Role::Leader,
            deferred: plan.deferred,
            ..EngineStats::default()
        };
        for (unit, reason) in &stats.deferred {
            debug!(unit = %unit, reason = %reason, "Unable to schedule unit");
        }

        for task in &plan.tasks {
            check_cancel(cancel)?;
            match self.apply(task).await {
                Ok(()) => match task.kind {
                    TaskKind::Schedule => stats.scheduled += 1,
                    TaskKind::Unschedule => stats.unscheduled += 1,
                },
                Err(e) => {
                    warn!(
                        task = %task.kind,
                        unit = %task.unit,
                        machine = %task.machine,
                        error = %e,
                        "Failed to apply task, ending pass"
                    );
                    stats.failed += 1;
                    break;
                }
            }
        }

        if stats.changed() {
            info!(
                scheduled = stats.scheduled,
                unscheduled = stats.unscheduled,
                deferred = stats.deferred.len(),
                failed = stats.failed,
                "Engine reconciliation complete"
            );
        } else {
            debug!(deferred = stats.deferred.len(), "Engine reconciliation found nothing to do");
        }
        Ok(stats)
    }

    async fn apply(&self, task: &Task) -> EngineResult<()> {
        match task.kind {
            TaskKind::Schedule => self.registry.schedule_unit(&task.unit, &task.machine).await?,
            TaskKind::Unschedule => self.registry.unschedule_unit(&task.unit, &task.machine).await?,
        }
        info!(
            task = %task.kind,
            unit = %task.unit,
            machine = %task.machine,
            reason = %task.reason,
            "Applied task"
        );
        Ok(())
    }

    /// Give up leadership, if held.
    async fn demote(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.leases.release(&lease).await {
                warn!(error = %e, "Failed to release engine lease");
            }
        }
    }

    /// Release the lease on shutdown so another engine can take over at
    /// once.
    pub async fn purge(&mut self) {
        if self.lease.is_some() {
            info!("Purging engine leadership");
        }
        self.demote().await;
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> EngineResult<()> {
    if *cancel.borrow() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use flotilla_testing::{launched, machine, machine_id, memory_registry, unit_name, UnitBuilder};
    use flotilla_unit::TargetState;

    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn engine(registry: &Registry, id: &str) -> Engine {
        Engine::new(registry.clone(), machine_id(id), EngineConfig::default())
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_schedules_and_sets_version() {
        let (_, registry) = memory_registry();
        registry.set_machine_state(&machine("m1"), TTL).await.unwrap();
        registry.create_unit(&launched("u1.service")).await.unwrap();

        let mut e = engine(&registry, "m1");
        let stats = e.tick(&no_cancel()).await.unwrap();
        assert_eq!(stats.role, Role::Leader);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(registry.engine_version().await.unwrap(), ENGINE_VERSION);
        let scheduled = registry.scheduled_unit(&unit_name("u1.service")).await.unwrap().unwrap();
        assert_eq!(scheduled.target_machine, Some(machine_id("m1")));

        // A second pass over an unchanged registry writes nothing.
        let before = registry.current_index().await.unwrap();
        let stats = e.tick(&no_cancel()).await.unwrap();
        assert!(!stats.changed());
        // Only the lease renewal moved the index.
        assert_eq!(registry.current_index().await.unwrap(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_does_nothing() {
        let (_, registry) = memory_registry();
        registry.set_machine_state(&machine("m1"), TTL).await.unwrap();
        let mut leader = engine(&registry, "a");
        let mut follower = engine(&registry, "b");
        leader.tick(&no_cancel()).await.unwrap();

        registry.create_unit(&launched("u1.service")).await.unwrap();
        let stats = follower.tick(&no_cancel()).await.unwrap();
        assert_eq!(stats.role, Role::Follower);
        assert_eq!(stats.scheduled, 0);
        assert_eq!(follower.role(), Role::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_cluster_version_demotes() {
        let (_, registry) = memory_registry();
        let mut e = engine(&registry, "a");
        e.tick(&no_cancel()).await.unwrap();
        assert_eq!(e.role(), Role::Leader);

        registry.update_engine_version(ENGINE_VERSION, ENGINE_VERSION + 1).await.unwrap();
        let stats = e.tick(&no_cancel()).await.unwrap();
        assert_eq!(stats.role, Role::Follower);
        assert_eq!(e.role(), Role::Follower);
        assert!(registry.get_lease(ENGINE_LEASE_NAME).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_is_reported() {
        let (_, registry) = memory_registry();
        let mut e = engine(&registry, "a");
        e.tick(&no_cancel()).await.unwrap();

        tokio::time::advance(e.config().lease_ttl + Duration::from_secs(1)).await;
        engine(&registry, "b").tick(&no_cancel()).await.unwrap();

        assert!(matches!(e.tick(&no_cancel()).await, Err(EngineError::LeaseLost)));
        assert_eq!(e.role(), Role::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pass_schedules_nothing() {
        let (_, registry) = memory_registry();
        registry.set_machine_state(&machine("m1"), TTL).await.unwrap();
        registry.create_unit(&launched("u1.service")).await.unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let mut e = engine(&registry, "m1");
        assert!(matches!(e.tick(&rx).await, Err(EngineError::Cancelled)));
        assert!(!registry.scheduled_unit(&unit_name("u1.service")).await.unwrap().unwrap().is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_unit_is_unscheduled() {
        let (_, registry) = memory_registry();
        registry.set_machine_state(&machine("m1"), TTL).await.unwrap();
        let unit = UnitBuilder::new("u4.service").build();
        registry.create_unit(&unit).await.unwrap();
        let mut e = engine(&registry, "m1");
        e.tick(&no_cancel()).await.unwrap();

        registry.set_unit_target_state(&unit.name, TargetState::Inactive).await.unwrap();
        let stats = e.tick(&no_cancel()).await.unwrap();
        assert_eq!(stats.unscheduled, 1);
        assert!(!registry.scheduled_unit(&unit.name).await.unwrap().unwrap().is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_on_lost_machine_is_moved() {
        let (_, registry) = memory_registry();
        registry.set_machine_state(&machine("m1"), TTL).await.unwrap();
        registry.create_unit(&launched("a.service")).await.unwrap();
        registry.schedule_unit(&unit_name("a.service"), &machine_id("gone")).await.unwrap();

        let mut e = engine(&registry, "m1");
        let stats = e.tick(&no_cancel()).await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.unscheduled, 1);
        assert_eq!(stats.scheduled, 1);
        let scheduled = registry.scheduled_unit(&unit_name("a.service")).await.unwrap().unwrap();
        assert_eq!(scheduled.target_machine, Some(machine_id("m1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_fails_tick() {
        let (store, registry) = memory_registry();
        let mut e = engine(&registry, "a");
        store.set_available(false);
        let err = e.tick(&no_cancel()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(e.role(), Role::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_releases_lease() {
        let (_, registry) = memory_registry();
        let mut e = engine(&registry, "a");
        e.tick(&no_cancel()).await.unwrap();
        e.purge().await;
        assert!(registry.get_lease(ENGINE_LEASE_NAME).await.unwrap().is_none());
        assert_eq!(e.role(), Role::Follower);
    }
}
