//! Cluster scenarios.
//!
//! Each test runs a small in-process cluster on one shared registry. A node
//! is an agent with a mock supervisor and, optionally, an engine, each woken
//! by its own event stream. Time is paused, so TTLs elapse instantly.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p flotilla-e2e --test scenarios
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flotilla_agent::{agent_event_filter, Agent, AgentConfig, AgentWorker, MockSupervisor, DEFAULT_MACHINE_TTL};
use flotilla_engine::{
    calculate_tasks, ClusterSnapshot, Engine, EngineConfig, EngineWorker, Scheduler, ENGINE_LEASE_NAME,
};
use flotilla_id::{MachineId, UnitName};
use flotilla_reconcile::DEFAULT_ENGINE_RECONCILE_INTERVAL;
use flotilla_registry::{EventStream, Registry, Unit};
use flotilla_testing::{init_tracing, launched, machine_id, memory_registry, unit_name, UnitBuilder};
use flotilla_unit::TargetState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TICK: Duration = DEFAULT_ENGINE_RECONCILE_INTERVAL;
const AGENT_TTL: Duration = DEFAULT_MACHINE_TTL;
const POLL: Duration = Duration::from_millis(100);

// =============================================================================
// Harness
// =============================================================================

struct Node {
    id: MachineId,
    supervisor: Arc<MockSupervisor>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Node {
    fn start(registry: &Registry, id: &str, with_engine: bool) -> Self {
        let id = machine_id(id);
        let supervisor = Arc::new(MockSupervisor::new());
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();

        if with_engine {
            let engine = Engine::new(registry.clone(), id.clone(), EngineConfig::with_interval(TICK));
            let (triggers, stream) = EventStream::new(registry.clone()).spawn(rx.clone());
            handles.push(stream);
            handles.push(flotilla_engine::worker::spawn(
                EngineWorker::new(engine).with_triggers(triggers),
                rx.clone(),
            ));
        }

        let agent = Agent::new(registry.clone(), supervisor.clone(), id.clone(), AgentConfig::default());
        let (triggers, stream) = EventStream::new(registry.clone())
            .with_filter(agent_event_filter(id.clone()))
            .spawn(rx.clone());
        handles.push(stream);
        handles.push(flotilla_agent::worker::spawn(
            AgentWorker::new(agent).with_triggers(triggers),
            rx,
        ));

        Self {
            id,
            supervisor,
            shutdown,
            handles,
        }
    }

    /// Stop without any cleanup, as if the machine lost power.
    async fn kill(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

/// Poll `check` until it holds, failing after `within`.
async fn wait_for<F, Fut>(within: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out after {within:?} waiting for {what}");
        tokio::time::sleep(POLL).await;
    }
}

async fn target_of(registry: &Registry, name: &str) -> Option<MachineId> {
    registry
        .scheduled_unit(&unit_name(name))
        .await
        .unwrap()
        .and_then(|s| s.target_machine)
}

async fn schedule_map(registry: &Registry) -> BTreeMap<UnitName, Option<MachineId>> {
    registry
        .schedule()
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.name, s.target_machine))
        .collect()
}

async fn lease_holder(registry: &Registry) -> Option<MachineId> {
    registry.get_lease(ENGINE_LEASE_NAME).await.unwrap().map(|l| l.holder)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_and_schedule() {
    init_tracing();
    let (_, registry) = memory_registry();
    let x = Node::start(&registry, "x", true);

    registry.create_unit(&launched("u1.service")).await.unwrap();

    wait_for(TICK * 3, "u1 scheduled to x", || {
        let registry = registry.clone();
        async move { target_of(&registry, "u1.service").await == Some(machine_id("x")) }
    })
    .await;
    wait_for(TICK * 3, "x to report u1", || {
        let registry = registry.clone();
        async move {
            registry.unit_states().await.unwrap().iter().any(|s| {
                s.unit_name == unit_name("u1.service")
                    && s.machine_id == machine_id("x")
                    && !s.active_state.is_empty()
            })
        }
    })
    .await;
    assert!(x.supervisor.is_running(&unit_name("u1.service")));

    x.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_node_loss_moves_units() {
    init_tracing();
    let (_, registry) = memory_registry();
    let y = Node::start(&registry, "y", true);
    registry.create_unit(&launched("u2.service")).await.unwrap();
    wait_for(TICK * 3, "u2 scheduled to y", || {
        let registry = registry.clone();
        async move { target_of(&registry, "u2.service").await == Some(machine_id("y")) }
    })
    .await;

    let x = Node::start(&registry, "x", true);
    let z = Node::start(&registry, "z", true);
    tokio::time::sleep(TICK).await;
    assert_eq!(registry.machines().await.unwrap().len(), 3);

    y.kill().await;

    wait_for(AGENT_TTL + TICK * 2, "y to drop out and u2 to move", || {
        let registry = registry.clone();
        async move {
            let machines: BTreeSet<MachineId> =
                registry.machines().await.unwrap().into_iter().map(|m| m.id).collect();
            let target = target_of(&registry, "u2.service").await;
            !machines.contains(&machine_id("y"))
                && matches!(target, Some(t) if t == machine_id("x") || t == machine_id("z"))
        }
    })
    .await;

    let name = unit_name("u2.service");
    wait_for(TICK * 3, "u2 to run on its new machine", || {
        let (x, z) = (x.supervisor.clone(), z.supervisor.clone());
        let name = name.clone();
        async move { x.is_running(&name) || z.is_running(&name) }
    })
    .await;

    x.stop().await;
    z.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_engine_failover() {
    init_tracing();
    let (_, registry) = memory_registry();
    let a = Node::start(&registry, "a", true);
    wait_for(TICK * 2, "a to lead", || {
        let registry = registry.clone();
        async move { lease_holder(&registry).await == Some(machine_id("a")) }
    })
    .await;

    let b = Node::start(&registry, "b", true);
    for unit in [
        UnitBuilder::new("on-a.service").pin("a").build(),
        UnitBuilder::new("on-b.service").pin("b").build(),
        launched("free.service"),
    ] {
        registry.create_unit(&unit).await.unwrap();
    }
    wait_for(TICK * 3, "every unit placed", || {
        let registry = registry.clone();
        async move { schedule_map(&registry).await.values().all(Option::is_some) }
    })
    .await;
    let placements = schedule_map(&registry).await;
    let version = registry.engine_version().await.unwrap();

    a.kill().await;
    let lease_ttl = EngineConfig::with_interval(TICK).lease_ttl;
    wait_for(lease_ttl + TICK, "b to take over", || {
        let registry = registry.clone();
        async move { lease_holder(&registry).await == Some(machine_id("b")) }
    })
    .await;

    // One more pass as leader, still inside a's machine TTL.
    tokio::time::sleep(TICK).await;
    assert_eq!(schedule_map(&registry).await, placements);
    assert!(registry.engine_version().await.unwrap() >= version);

    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_pinned_unit_waits_for_its_machine() {
    init_tracing();
    let (_, registry) = memory_registry();
    let x = Node::start(&registry, "x", true);
    let unit = UnitBuilder::new("u3.service").pin("ZZZ").build();
    registry.create_unit(&unit).await.unwrap();

    wait_for(TICK * 3, "u3 scheduled to ZZZ", || {
        let registry = registry.clone();
        async move { target_of(&registry, "u3.service").await == Some(machine_id("ZZZ")) }
    })
    .await;
    tokio::time::sleep(TICK * 3).await;
    assert_eq!(target_of(&registry, "u3.service").await, Some(machine_id("ZZZ")));
    assert!(!x.supervisor.is_loaded(&unit.name));

    let zzz = Node::start(&registry, "ZZZ", false);
    wait_for(AgentConfig::default().reconcile_interval, "u3 to launch on ZZZ", || {
        let supervisor = zzz.supervisor.clone();
        let name = unit.name.clone();
        async move { supervisor.is_running(&name) }
    })
    .await;
    assert_eq!(zzz.id, machine_id("ZZZ"));

    zzz.stop().await;
    x.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_desired_inactive_unloads_and_relaunches() {
    init_tracing();
    let (_, registry) = memory_registry();
    let x = Node::start(&registry, "x", true);
    let name = unit_name("u4.service");
    registry.create_unit(&launched("u4.service")).await.unwrap();
    wait_for(TICK * 3, "u4 running", || {
        let supervisor = x.supervisor.clone();
        let name = name.clone();
        async move { supervisor.is_running(&name) }
    })
    .await;

    registry.set_unit_target_state(&name, TargetState::Inactive).await.unwrap();
    wait_for(TICK * 2, "u4 unscheduled and unloaded", || {
        let registry = registry.clone();
        let supervisor = x.supervisor.clone();
        let name = name.clone();
        async move { target_of(&registry, "u4.service").await.is_none() && !supervisor.is_loaded(&name) }
    })
    .await;

    registry.set_unit_target_state(&name, TargetState::Launched).await.unwrap();
    wait_for(TICK * 3, "u4 rescheduled and running", || {
        let registry = registry.clone();
        let supervisor = x.supervisor.clone();
        let name = name.clone();
        async move { target_of(&registry, "u4.service").await.is_some() && supervisor.is_running(&name) }
    })
    .await;

    x.stop().await;
}

fn conflicting(name: &str) -> Unit {
    UnitBuilder::new(name).conflicts("c*.service").build()
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_units_spread_across_machines() {
    init_tracing();
    let (_, registry) = memory_registry();
    let nodes: Vec<Node> = ["x", "y", "z"].iter().map(|id| Node::start(&registry, id, true)).collect();
    tokio::time::sleep(TICK).await;
    for name in ["c1.service", "c2.service", "c3.service"] {
        registry.create_unit(&conflicting(name)).await.unwrap();
    }

    wait_for(TICK * 3, "three units on three machines", || {
        let registry = registry.clone();
        async move {
            let targets: Vec<_> = schedule_map(&registry).await.into_values().collect();
            let distinct: BTreeSet<_> = targets.iter().flatten().collect();
            targets.iter().all(Option::is_some) && distinct.len() == 3
        }
    })
    .await;

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_units_defer_without_room() {
    init_tracing();
    let (_, registry) = memory_registry();
    let nodes: Vec<Node> = ["x", "y"].iter().map(|id| Node::start(&registry, id, true)).collect();
    tokio::time::sleep(TICK).await;
    for name in ["c1.service", "c2.service", "c3.service"] {
        registry.create_unit(&conflicting(name)).await.unwrap();
    }

    wait_for(TICK * 3, "two units placed", || {
        let registry = registry.clone();
        async move { schedule_map(&registry).await.values().flatten().count() == 2 }
    })
    .await;
    tokio::time::sleep(TICK * 3).await;
    assert_eq!(schedule_map(&registry).await.values().flatten().count(), 2);

    let snapshot = ClusterSnapshot::load(&registry).await.unwrap();
    let plan = calculate_tasks(&snapshot, &Scheduler::default());
    assert!(plan.tasks.is_empty());
    assert_eq!(plan.deferred.len(), 1);
    assert!(!plan.deferred[0].1.is_empty());

    for node in nodes {
        node.stop().await;
    }
}
