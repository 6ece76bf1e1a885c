//! Heartbeat loops.
//!
//! Each loop refreshes a TTL-bound record at half its TTL:
//! - the machine record, republished as soon as the agent changes it
//! - one heartbeat per running unit

use std::sync::Arc;
use std::time::Duration;

use flotilla_id::MachineId;
use flotilla_reconcile::RetryPolicy;
use flotilla_registry::{MachineState, Registry, RegistryError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::supervisor::Supervisor;

/// Attempts per machine heartbeat before it is reported as failed.
const MACHINE_HEARTBEAT_ATTEMPTS: u32 = 4;

/// Retries fit within a third of the TTL.
fn machine_retry_policy(ttl: Duration) -> RetryPolicy {
    let delay = ttl / 12;
    RetryPolicy {
        max_attempts: MACHINE_HEARTBEAT_ATTEMPTS,
        base_delay: delay,
        max_delay: delay,
    }
}

fn refresh_interval(ttl: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn log_failure(consecutive_failures: u32, error: &RegistryError, what: &str) {
    if consecutive_failures <= 3 {
        warn!(error = %error, consecutive_failures, what, "Heartbeat failed");
    } else {
        error!(error = %error, consecutive_failures, what, "Heartbeat failed repeatedly");
    }
}

/// Publish the machine record every `ttl / 2`, and whenever it changes,
/// until shutdown.
#[instrument(skip_all, fields(machine = %state.borrow().id))]
pub async fn run_machine_heartbeat(
    registry: Registry,
    mut state: watch::Receiver<MachineState>,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(ttl_secs = ttl.as_secs(), "Starting machine heartbeat");

    let policy = machine_retry_policy(ttl);
    let mut interval = refresh_interval(ttl);
    let mut consecutive_failures = 0u32;
    let mut state_open = true;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                    continue;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Machine heartbeat shutting down");
                    break;
                }
                continue;
            }
        }

        let record = state.borrow_and_update().clone();
        let published = policy
            .retry("machine_heartbeat", RegistryError::is_retryable, || {
                registry.set_machine_state(&record, ttl)
            })
            .await;
        match published {
            Ok(index) => {
                consecutive_failures = 0;
                debug!(index, loaded_units = record.loaded_units, "Machine heartbeat published");
            }
            Err(e) => {
                consecutive_failures += 1;
                log_failure(consecutive_failures, &e, "machine");
            }
        }
    }
}

/// Refresh the heartbeat of every running unit every `ttl / 2` until
/// shutdown.
#[instrument(skip_all, fields(machine = %machine))]
pub async fn run_unit_heartbeat(
    registry: Registry,
    supervisor: Arc<dyn Supervisor>,
    machine: MachineId,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(ttl_secs = ttl.as_secs(), "Starting unit heartbeat");

    let mut interval = refresh_interval(ttl);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let units = match supervisor.list().await {
                    Ok(units) => units,
                    Err(e) => {
                        warn!(error = %e, "Failed to list units for heartbeat");
                        continue;
                    }
                };

                let mut failed = None;
                let mut refreshed = 0usize;
                for unit in units.iter().filter(|u| u.is_running()) {
                    match registry.unit_heartbeat(&unit.name, &machine, ttl).await {
                        Ok(()) => refreshed += 1,
                        Err(e) => failed = Some(e),
                    }
                }

                match failed {
                    None => {
                        consecutive_failures = 0;
                        if refreshed > 0 {
                            debug!(refreshed, "Unit heartbeats published");
                        }
                    }
                    Some(e) => {
                        consecutive_failures += 1;
                        log_failure(consecutive_failures, &e, "unit");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Unit heartbeat shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use flotilla_testing::{launched, machine, machine_id, memory_registry, unit_name};
    use flotilla_unit::{TargetState, UnitState};

    use super::*;
    use crate::supervisor::MockSupervisor;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_retries_fit_in_a_third_of_the_ttl() {
        let policy = machine_retry_policy(TTL);
        let worst: Duration = (1..policy.max_attempts)
            .map(|_| policy.max_delay + policy.max_delay / 10)
            .sum();
        assert!(worst <= TTL / 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_record_outlives_its_ttl() {
        let (_, registry) = memory_registry();
        let (_state_tx, state_rx) = watch::channel(machine("m1"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_machine_heartbeat(registry.clone(), state_rx, TTL, shutdown_rx));

        tokio::time::sleep(TTL * 3).await;
        assert_eq!(registry.machines().await.unwrap().len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(TTL + Duration::from_secs(1)).await;
        assert!(registry.machines().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_record_republished_on_change() {
        let (_, registry) = memory_registry();
        let (state_tx, state_rx) = watch::channel(machine("m1"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_machine_heartbeat(registry.clone(), state_rx, TTL, shutdown_rx));
        tokio::time::sleep(Duration::from_secs(1)).await;

        state_tx.send_modify(|s| s.loaded_units = 7);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let published = registry.machine(&machine_id("m1")).await.unwrap().unwrap();
        assert_eq!(published.loaded_units, 7);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_units_keep_their_heartbeat() {
        let (_, registry) = memory_registry();
        let unit = launched("a.service");
        let m1 = machine_id("m1");
        registry.create_unit(&unit).await.unwrap();
        registry.schedule_unit(&unit.name, &m1).await.unwrap();
        let state = UnitState {
            unit_name: unit.name.clone(),
            unit_hash: unit.hash.clone(),
            load_state: "loaded".to_string(),
            active_state: "active".to_string(),
            sub_state: "running".to_string(),
            machine_id: m1.clone(),
        };
        registry.save_unit_state(&unit.name, &state, Duration::from_secs(3600)).await.unwrap();

        let supervisor = Arc::new(MockSupervisor::new());
        supervisor.load(&unit.name, &unit.payload()).await.unwrap();
        supervisor.start(&unit.name).await.unwrap();

        let ttl = Duration::from_secs(15);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_unit_heartbeat(
            registry.clone(),
            supervisor.clone(),
            m1.clone(),
            ttl,
            shutdown_rx,
        ));

        let current = |registry: Registry| async move {
            registry.scheduled_unit(&unit_name("a.service")).await.unwrap().unwrap().current_state
        };

        tokio::time::sleep(ttl * 4).await;
        assert_eq!(current(registry.clone()).await, TargetState::Launched);

        // A stopped unit is no longer refreshed.
        supervisor.stop(&unit.name).await.unwrap();
        tokio::time::sleep(ttl * 2).await;
        assert_eq!(current(registry.clone()).await, TargetState::Loaded);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
