//! Engine background worker.
//!
//! Runs engine ticks on a periodic interval and, when an event stream is
//! attached, whenever it delivers a trigger.

use flotilla_registry::Trigger;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;

/// Engine worker that runs the reconciliation loop.
pub struct EngineWorker {
    engine: Engine,
    triggers: Option<mpsc::Receiver<Trigger>>,
}

impl EngineWorker {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            triggers: None,
        }
    }

    /// Also reconcile whenever the event stream fires.
    pub fn with_triggers(mut self, triggers: mpsc::Receiver<Trigger>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    /// Run the engine until shutdown is signaled, then purge.
    #[instrument(skip(self, shutdown), fields(machine = %self.engine.machine()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.engine.config().reconcile_interval;
        info!(interval_ms = period.as_millis() as u64, "Starting engine worker");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_tick(&shutdown).await;
                }
                trigger = next_trigger(&mut self.triggers) => {
                    match trigger {
                        Some(trigger) => {
                            debug!(events = trigger.events().len(), "Engine triggered by registry events");
                            self.run_tick(&shutdown).await;
                        }
                        None => {
                            debug!("Event stream closed, continuing on the periodic tick");
                            self.triggers = None;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Engine worker shutting down");
                        break;
                    }
                }
            }
        }

        self.engine.purge().await;
    }

    /// One tick, bounded by the lease TTL.
    async fn run_tick(&mut self, shutdown: &watch::Receiver<bool>) {
        let deadline = self.engine.config().lease_ttl;
        match tokio::time::timeout(deadline, self.engine.tick(shutdown)).await {
            Ok(Ok(_)) | Ok(Err(EngineError::Cancelled)) => {}
            Ok(Err(EngineError::LeaseLost)) => warn!("Lost engine leadership"),
            Ok(Err(e)) => error!(error = %e, "Engine reconciliation failed"),
            Err(_) => warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Engine reconciliation aborted after the lease TTL"
            ),
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
pub fn spawn(worker: EngineWorker, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(worker.run(shutdown))
}
