//! Agent background worker.
//!
//! Runs the machine and unit heartbeats alongside the reconcile loop. On
//! graceful shutdown the heartbeats stop first, then the agent purges its
//! records so the cluster reschedules at once.

use flotilla_events::RegistryEvent;
use flotilla_id::MachineId;
use flotilla_registry::Trigger;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::Agent;
use crate::heartbeat::{run_machine_heartbeat, run_unit_heartbeat};

pub struct AgentWorker {
    agent: Agent,
    triggers: Option<mpsc::Receiver<Trigger>>,
    purge_on_shutdown: bool,
}

impl AgentWorker {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            triggers: None,
            purge_on_shutdown: true,
        }
    }

    /// Also reconcile whenever the event stream fires.
    pub fn with_triggers(mut self, triggers: mpsc::Receiver<Trigger>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    /// Leave units and records in place on shutdown; they expire by TTL.
    pub fn without_purge(mut self) -> Self {
        self.purge_on_shutdown = false;
        self
    }

    /// Run the agent until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(machine = %self.agent.machine()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.agent.config().clone();
        info!(
            interval_ms = config.reconcile_interval.as_millis() as u64,
            machine_ttl_secs = config.machine_ttl.as_secs(),
            unit_ttl_secs = config.unit_ttl.as_secs(),
            "Starting agent worker"
        );

        // Dropping the set aborts the heartbeats with the worker.
        let mut heartbeats = JoinSet::new();
        heartbeats.spawn(run_machine_heartbeat(
            self.agent.registry().clone(),
            self.agent.machine_state(),
            config.machine_ttl,
            shutdown.clone(),
        ));
        heartbeats.spawn(run_unit_heartbeat(
            self.agent.registry().clone(),
            self.agent.supervisor(),
            self.agent.machine().clone(),
            config.unit_ttl,
            shutdown.clone(),
        ));

        let mut interval = tokio::time::interval(config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                trigger = next_trigger(&mut self.triggers) => {
                    match trigger {
                        Some(trigger) => {
                            debug!(events = trigger.events().len(), "Agent triggered by registry events");
                            self.run_pass().await;
                        }
                        None => {
                            debug!("Event stream closed, continuing on the periodic tick");
                            self.triggers = None;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Agent worker shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = heartbeats.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }

        if self.purge_on_shutdown {
            if let Err(e) = self.agent.purge().await {
                error!(error = %e, "Failed to purge agent");
            }
        }
    }

    async fn run_pass(&mut self) {
        if let Err(e) = self.agent.reconcile().await {
            error!(error = %e, "Agent reconciliation failed");
        }
    }
}

async fn next_trigger(triggers: &mut Option<mpsc::Receiver<Trigger>>) -> Option<Trigger> {
    match triggers {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Spawn a worker on the current runtime.
pub fn spawn(worker: AgentWorker, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(worker.run(shutdown))
}

/// Events that can change what `machine` should run.
pub fn agent_event_filter(machine: MachineId) -> impl Fn(&RegistryEvent) -> bool + Send + Sync + 'static {
    move |event| match event {
        RegistryEvent::UnitCreated { .. }
        | RegistryEvent::UnitDestroyed { .. }
        | RegistryEvent::TargetStateChanged { .. } => true,
        RegistryEvent::ScheduleChanged { machine: target, .. } => {
            target.as_ref().is_none_or(|target| target == &machine)
        }
        RegistryEvent::MachineCreated { .. }
        | RegistryEvent::MachineLost { .. }
        | RegistryEvent::UnitStateChanged { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use flotilla_testing::{launched, machine_id, memory_registry, unit_name};
    use rstest::rstest;

    use super::*;
    use crate::agent::AgentConfig;
    use crate::supervisor::MockSupervisor;

    #[rstest]
    #[case::created(RegistryEvent::UnitCreated { unit: unit_name("a.service") }, true)]
    #[case::target_state(RegistryEvent::TargetStateChanged { unit: unit_name("a.service") }, true)]
    #[case::scheduled_here(RegistryEvent::ScheduleChanged { unit: unit_name("a.service"), machine: Some(machine_id("m1")) }, true)]
    #[case::unscheduled(RegistryEvent::ScheduleChanged { unit: unit_name("a.service"), machine: None }, true)]
    #[case::scheduled_elsewhere(RegistryEvent::ScheduleChanged { unit: unit_name("a.service"), machine: Some(machine_id("m2")) }, false)]
    #[case::machine_lost(RegistryEvent::MachineLost { machine: machine_id("m2") }, false)]
    #[case::unit_state(RegistryEvent::UnitStateChanged { unit: unit_name("a.service"), machine: None }, false)]
    fn test_agent_event_filter(#[case] event: RegistryEvent, #[case] expected: bool) {
        assert_eq!(agent_event_filter(machine_id("m1"))(&event), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_runs_unit_then_purges_on_shutdown() {
        let (_, registry) = memory_registry();
        let unit = launched("u1.service");
        registry.create_unit(&unit).await.unwrap();
        registry.schedule_unit(&unit.name, &machine_id("m1")).await.unwrap();

        let supervisor = Arc::new(MockSupervisor::new());
        let agent = Agent::new(registry.clone(), supervisor.clone(), machine_id("m1"), AgentConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn(AgentWorker::new(agent), rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(supervisor.is_running(&unit.name));
        assert_eq!(registry.machines().await.unwrap().len(), 1);
        assert_eq!(registry.unit_states().await.unwrap().len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!supervisor.is_loaded(&unit.name));
        assert!(registry.machines().await.unwrap().is_empty());
        assert!(registry.unit_states().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_runs_a_pass_before_the_tick() {
        let (_, registry) = memory_registry();
        let supervisor = Arc::new(MockSupervisor::new());
        let config = AgentConfig::new(Duration::from_secs(60), Duration::from_secs(600));
        let agent = Agent::new(registry.clone(), supervisor.clone(), machine_id("m1"), config);
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let (tx, rx) = watch::channel(false);
        let handle = spawn(AgentWorker::new(agent).with_triggers(trigger_rx).without_purge(), rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let unit = launched("u1.service");
        registry.create_unit(&unit).await.unwrap();
        registry.schedule_unit(&unit.name, &machine_id("m1")).await.unwrap();
        trigger_tx.send(Trigger::FullReconcile).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(supervisor.is_running(&unit.name));

        tx.send(true).unwrap();
        handle.await.unwrap();
        // Without purge the unit keeps running.
        assert!(supervisor.is_running(&unit.name));
    }
}
