//! The node reconciler.
//!
//! The agent owns the local supervisor. A reconcile pass:
//! 1. reads the units scheduled to this machine (plus matching global units)
//! 2. reads what the supervisor has loaded
//! 3. applies the difference as ordered tasks, isolating per-unit failures
//! 4. publishes a unit state for every loaded unit it owns and refreshes the
//!    machine record handed to the heartbeat loop

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_id::{MachineId, UnitName};
use flotilla_reconcile::{Backoff, DEFAULT_AGENT_RECONCILE_INTERVAL};
use flotilla_registry::{MachineState, Registry};
use flotilla_unit::{ResourceTuple, UnitState, HOST_RESERVED};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::UnitCache;
use crate::error::{AgentError, AgentResult};
use crate::supervisor::{Supervisor, UnitStatus};
use crate::tasks::{calculate_tasks, AgentTask, AgentTaskKind, DesiredUnit, LoadedUnit, REASON_PURGING_AGENT};

/// Default machine record TTL.
pub const DEFAULT_MACHINE_TTL: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub reconcile_interval: Duration,
    /// TTL of the machine record.
    pub machine_ttl: Duration,
    /// TTL of unit states and unit heartbeats.
    pub unit_ttl: Duration,
    pub public_ip: String,
    pub metadata: BTreeMap<String, String>,
    pub capabilities: BTreeSet<String>,
    /// Total machine resources.
    pub resources: ResourceTuple,
}

impl AgentConfig {
    /// Configuration for a given tick and machine TTL; unit records live
    /// three ticks.
    pub fn new(reconcile_interval: Duration, machine_ttl: Duration) -> Self {
        Self {
            reconcile_interval,
            machine_ttl,
            unit_ttl: reconcile_interval * 3,
            public_ip: String::new(),
            metadata: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            resources: ResourceTuple::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_RECONCILE_INTERVAL, DEFAULT_MACHINE_TTL)
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Statistics from one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub desired: usize,
    pub loaded: usize,
    pub unloaded: usize,
    pub started: usize,
    pub stopped: usize,
    /// Units whose tasks failed this pass.
    pub failed: usize,
    /// Units skipped because they are backing off.
    pub backing_off: usize,
    pub states_published: usize,
}

impl AgentStats {
    pub fn changed(&self) -> bool {
        self.loaded + self.unloaded + self.started + self.stopped + self.failed > 0
    }

    fn record(&mut self, kind: AgentTaskKind) {
        match kind {
            AgentTaskKind::LoadUnit => self.loaded += 1,
            AgentTaskKind::UnloadUnit => self.unloaded += 1,
            AgentTaskKind::StartUnit => self.started += 1,
            AgentTaskKind::StopUnit => self.stopped += 1,
        }
    }
}

/// Units this machine should hold.
#[derive(Debug, Default)]
struct Desired {
    units: BTreeMap<UnitName, DesiredUnit>,
    reservations: BTreeMap<UnitName, ResourceTuple>,
}

pub struct Agent {
    registry: Registry,
    supervisor: Arc<dyn Supervisor>,
    machine: MachineId,
    config: AgentConfig,
    cache: UnitCache,
    backoff: Backoff,
    /// Units whose state this agent has published.
    published: BTreeSet<UnitName>,
    state_tx: watch::Sender<MachineState>,
}

impl Agent {
    pub fn new(
        registry: Registry,
        supervisor: Arc<dyn Supervisor>,
        machine: MachineId,
        config: AgentConfig,
    ) -> Self {
        let mut state = MachineState::new(machine.clone());
        state.public_ip = config.public_ip.clone();
        state.metadata = config.metadata.clone();
        state.capabilities = config.capabilities.clone();
        state.total_resources = config.resources;
        state.free_resources = config.resources.saturating_sub(&HOST_RESERVED);
        let (state_tx, _) = watch::channel(state);

        Self {
            registry,
            supervisor,
            backoff: Backoff::new(config.reconcile_interval, config.machine_ttl),
            machine,
            config,
            cache: UnitCache::new(),
            published: BTreeSet::new(),
            state_tx,
        }
    }

    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn supervisor(&self) -> Arc<dyn Supervisor> {
        self.supervisor.clone()
    }

    /// The machine record as of the last pass.
    pub fn machine_state(&self) -> watch::Receiver<MachineState> {
        self.state_tx.subscribe()
    }

    /// Run one reconcile pass.
    #[instrument(skip(self), fields(machine = %self.machine))]
    pub async fn reconcile(&mut self) -> AgentResult<AgentStats> {
        let started = Instant::now();

        let desired = self.desired_units().await?;
        let current = self.current_units().await?;
        let tasks = calculate_tasks(&desired.units, &current);

        let mut stats = AgentStats {
            desired: desired.units.len(),
            ..AgentStats::default()
        };

        self.backoff
            .retain(|key| desired.units.keys().chain(current.keys()).any(|n| n.as_str() == key));

        let now = Instant::now();
        let mut blocked: BTreeSet<UnitName> = BTreeSet::new();
        for task in &tasks {
            if blocked.contains(&task.unit) {
                continue;
            }
            if !self.backoff.is_ready(task.unit.as_str(), now) {
                debug!(unit = %task.unit, task = %task.kind, "Unit is backing off, skipping");
                stats.backing_off += 1;
                blocked.insert(task.unit.clone());
                continue;
            }

            match self.run_task(task, desired.units.get(&task.unit)).await {
                Ok(()) => stats.record(task.kind),
                Err(e) => {
                    let delay = self.backoff.record_failure(task.unit.as_str(), now);
                    warn!(
                        unit = %task.unit,
                        task = %task.kind,
                        reason = task.reason,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to run task"
                    );
                    stats.failed += 1;
                    blocked.insert(task.unit.clone());
                }
            }
        }
        for task in &tasks {
            if !blocked.contains(&task.unit) {
                self.backoff.clear(task.unit.as_str());
            }
        }

        stats.states_published = self.publish_states(&desired).await;

        if stats.changed() {
            info!(
                desired = stats.desired,
                loaded = stats.loaded,
                unloaded = stats.unloaded,
                started = stats.started,
                stopped = stats.stopped,
                failed = stats.failed,
                backing_off = stats.backing_off,
                "Agent reconciliation complete"
            );
        } else {
            debug!(desired = stats.desired, "Agent reconciliation found nothing to do");
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.reconcile_interval {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Agent reconciliation took longer than the reconcile interval"
            );
        }
        Ok(stats)
    }

    async fn desired_units(&self) -> AgentResult<Desired> {
        let units = self.registry.units().await?;
        let schedule: BTreeMap<UnitName, Option<MachineId>> = self
            .registry
            .schedule()
            .await?
            .into_iter()
            .map(|s| (s.name, s.target_machine))
            .collect();
        let metadata = match self.registry.machine(&self.machine).await? {
            Some(state) => state.metadata,
            None => self.config.metadata.clone(),
        };

        let mut desired = Desired::default();
        for unit in units {
            let options = match unit.options() {
                Ok(options) => options,
                Err(e) => {
                    warn!(unit = %unit.name, error = %e, "Ignoring unit with invalid options");
                    continue;
                }
            };

            let ours = if options.global {
                let eligible = options.metadata_satisfied_by(&metadata);
                if !eligible {
                    debug!(unit = %unit.name, "Global unit requires metadata this machine lacks");
                }
                eligible
            } else {
                schedule.get(&unit.name).and_then(Option::as_ref) == Some(&self.machine)
            };
            if !ours {
                continue;
            }

            desired.reservations.insert(unit.name.clone(), options.resources);
            desired.units.insert(
                unit.name,
                DesiredUnit {
                    hash: unit.hash,
                    target_state: unit.target_state,
                },
            );
        }
        Ok(desired)
    }

    async fn current_units(&mut self) -> AgentResult<BTreeMap<UnitName, LoadedUnit>> {
        let statuses = self.supervisor.list().await?;
        let listed: BTreeSet<&UnitName> = statuses.iter().map(|s| &s.name).collect();
        self.cache.retain(|name| listed.contains(name));

        Ok(statuses
            .iter()
            .map(|status| {
                let hash = status.hash.clone().or_else(|| self.cache.hash(&status.name).cloned());
                (
                    status.name.clone(),
                    LoadedUnit {
                        hash,
                        running: status.is_running(),
                    },
                )
            })
            .collect())
    }

    async fn run_task(&mut self, task: &AgentTask, desired: Option<&DesiredUnit>) -> AgentResult<()> {
        let name = &task.unit;
        match task.kind {
            AgentTaskKind::LoadUnit => {
                let Some(desired) = desired else {
                    return Ok(());
                };
                let payload = self
                    .registry
                    .unit_blob(&desired.hash)
                    .await?
                    .ok_or_else(|| AgentError::MissingPayload(desired.hash.to_string()))?;
                self.supervisor.load(name, &payload).await?;
                self.cache.loaded(name, desired.hash.clone());
            }
            AgentTaskKind::StartUnit => {
                self.supervisor.start(name).await?;
                self.cache.launched(name);
                if let Err(e) = self
                    .registry
                    .unit_heartbeat(name, &self.machine, self.config.unit_ttl)
                    .await
                {
                    warn!(unit = %name, error = %e, "Failed to publish unit heartbeat");
                }
            }
            AgentTaskKind::StopUnit => {
                self.clear_heartbeat(name).await;
                self.supervisor.stop(name).await?;
                self.cache.stopped(name);
            }
            AgentTaskKind::UnloadUnit => {
                self.clear_heartbeat(name).await;
                self.supervisor.unload(name).await?;
                self.cache.unloaded(name);
            }
        }
        info!(unit = %name, task = %task.kind, reason = task.reason, "Ran task");
        Ok(())
    }

    async fn clear_heartbeat(&self, name: &UnitName) {
        if let Err(e) = self.registry.clear_unit_heartbeat(name).await {
            warn!(unit = %name, error = %e, "Failed to clear unit heartbeat");
        }
    }

    /// Publish a state for every loaded unit this machine owns, withdraw the
    /// rest, and refresh the machine record. Returns the number published.
    async fn publish_states(&mut self, desired: &Desired) -> usize {
        let statuses = match self.supervisor.list().await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Failed to list units for state publication");
                return 0;
            }
        };

        let mut published = BTreeSet::new();
        for status in &statuses {
            let Some(wanted) = desired.units.get(&status.name) else {
                continue;
            };
            let state = self.unit_state(status, wanted);
            match self
                .registry
                .save_unit_state(&status.name, &state, self.config.unit_ttl)
                .await
            {
                Ok(()) => {
                    published.insert(status.name.clone());
                }
                Err(e) => warn!(unit = %status.name, error = %e, "Failed to publish unit state"),
            }
        }

        let count = published.len();

        // States that failed to withdraw stay tracked so the next pass retries.
        let withdrawn: Vec<UnitName> = self.published.difference(&published).cloned().collect();
        for name in withdrawn {
            if let Err(e) = self.registry.remove_machine_unit_state(&name, &self.machine).await {
                warn!(unit = %name, error = %e, "Failed to withdraw unit state");
                published.insert(name);
            }
        }
        self.published = published;

        let reserved: ResourceTuple = statuses
            .iter()
            .filter_map(|s| desired.reservations.get(&s.name).copied())
            .sum();
        self.state_tx.send_modify(|state| {
            state.free_resources = self
                .config
                .resources
                .saturating_sub(&HOST_RESERVED)
                .saturating_sub(&reserved);
            state.loaded_units = statuses.len() as u32;
            state.published_at = Utc::now();
        });
        count
    }

    fn unit_state(&self, status: &UnitStatus, desired: &DesiredUnit) -> UnitState {
        UnitState {
            unit_name: status.name.clone(),
            unit_hash: status
                .hash
                .clone()
                .or_else(|| self.cache.hash(&status.name).cloned())
                .unwrap_or_else(|| desired.hash.clone()),
            load_state: status.load_state.clone(),
            active_state: status.active_state.clone(),
            sub_state: status.sub_state.clone(),
            machine_id: self.machine.clone(),
        }
    }

    /// Unload everything, withdraw this machine's records and remove the
    /// machine, so the cluster reschedules at once.
    #[instrument(skip(self), fields(machine = %self.machine))]
    pub async fn purge(&mut self) -> AgentResult<()> {
        info!("Purging agent");
        let statuses = match self.supervisor.list().await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Failed to list units while purging");
                Vec::new()
            }
        };

        let mut names: BTreeSet<UnitName> = statuses.into_iter().map(|s| s.name).collect();
        names.extend(self.published.iter().cloned());
        for name in &names {
            let task = AgentTask::new(AgentTaskKind::UnloadUnit, name, REASON_PURGING_AGENT);
            if let Err(e) = self.run_task(&task, None).await {
                warn!(unit = %name, error = %e, "Failed to unload unit while purging");
            }
            if let Err(e) = self.registry.remove_machine_unit_state(name, &self.machine).await {
                warn!(unit = %name, error = %e, "Failed to withdraw unit state while purging");
            }
        }
        self.published.clear();

        self.registry.remove_machine_state(&self.machine).await?;
        Ok(())
    }
}
