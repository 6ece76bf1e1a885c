//! fleetd
//!
//! Runs one flotilla machine: the agent that drives the local supervisor
//! and, unless disabled, an engine that competes for cluster leadership.
//!
//! ## Architecture
//!
//! - **Registry**: typed cluster state over the embedded KV store
//! - **Event streams**: wake the engine and the agent on relevant changes
//! - **Engine worker**: leader election and placement
//! - **Agent worker**: local convergence, unit states and heartbeats

use std::sync::Arc;

use anyhow::Result;
use flotilla_agent::{agent_event_filter, Agent, AgentConfig, AgentWorker, MockSupervisor};
use flotilla_engine::{Engine, EngineConfig, EngineWorker};
use flotilla_reconcile::{RetryPolicy, DEFAULT_AGENT_RECONCILE_INTERVAL};
use flotilla_registry::{EventStream, MemoryStore, Registry, RegistryConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Config, SupervisorBackend};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        machine = %config.machine_id,
        endpoints = ?config.etcd_endpoints,
        key_prefix = %config.key_prefix,
        agent_ttl_secs = config.agent_ttl.as_secs(),
        engine_enabled = !config.disable_engine,
        supervisor = ?config.supervisor,
        "Starting fleetd"
    );
    warn!("No remote KV client is built in; running against the embedded store");

    let registry = Registry::new(
        Arc::new(MemoryStore::new()),
        RegistryConfig {
            key_prefix: config.key_prefix.clone(),
            request_timeout: config.request_timeout,
            retry: RetryPolicy::default(),
            page_limit: config.token_limit,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<(&str, JoinHandle<()>)> = Vec::new();

    if config.disable_engine {
        info!("Engine disabled on this machine");
    } else {
        let engine = Engine::new(
            registry.clone(),
            config.machine_id.clone(),
            EngineConfig::with_interval(config.engine_reconcile_interval),
        );
        let (triggers, stream) = EventStream::new(registry.clone()).spawn(shutdown_rx.clone());
        let worker = EngineWorker::new(engine).with_triggers(triggers);
        handles.push(("engine event stream", stream));
        handles.push((
            "engine",
            flotilla_engine::worker::spawn(worker, shutdown_rx.clone()),
        ));
    }

    let mut agent_config = AgentConfig::new(DEFAULT_AGENT_RECONCILE_INTERVAL, config.agent_ttl);
    agent_config.public_ip = config.public_ip.clone();
    agent_config.metadata = config.metadata.clone();
    agent_config.capabilities = config.capabilities.clone();
    let supervisor = match config.supervisor {
        SupervisorBackend::Mock => {
            warn!("Using the in-process mock supervisor; units are tracked but not executed");
            Arc::new(MockSupervisor::new())
        }
    };
    let agent = Agent::new(
        registry.clone(),
        supervisor,
        config.machine_id.clone(),
        agent_config,
    );
    let (triggers, stream) = EventStream::new(registry.clone())
        .with_filter(agent_event_filter(config.machine_id.clone()))
        .spawn(shutdown_rx.clone());
    handles.push(("agent event stream", stream));
    handles.push((
        "agent",
        flotilla_agent::worker::spawn(AgentWorker::new(agent).with_triggers(triggers), shutdown_rx),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let drained = tokio::time::timeout(config.agent_ttl, async {
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Workers did not stop in time");
    }

    info!("fleetd shutdown complete");
    Ok(())
}
