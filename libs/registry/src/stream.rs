//! Event stream: classified, coalesced registry changes.
//!
//! The stream watches every key under the prefix, classifies raw KV changes
//! into [`RegistryEvent`]s and forwards them as [`Trigger`]s. Bursts within
//! the coalescing window collapse into one trigger, keeping only the latest
//! event per KV key. A cleared watch index drops the stream and asks the
//! consumer for a full reconcile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flotilla_events::{ObservedEvent, RegistryEvent};
use flotilla_id::MachineId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::keys::{KeyLayout, ParsedKey};
use crate::kv::{KvError, KvEvent, KvWatch};
use crate::Registry;

/// What the stream asks its consumer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A coalesced batch of events, in index order.
    Events(Vec<ObservedEvent>),
    /// Events may have been lost; rebuild state from scratch.
    FullReconcile,
}

impl Trigger {
    pub fn events(&self) -> &[ObservedEvent] {
        match self {
            Self::Events(events) => events,
            Self::FullReconcile => &[],
        }
    }
}

/// Event stream configuration.
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// How long after the first event of a burst to wait for more.
    pub coalesce_window: Duration,
    /// Delay before re-opening a watch that failed.
    pub retry_delay: Duration,
    /// Capacity of the trigger channel.
    pub channel_capacity: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(100),
            retry_delay: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }
}

type EventFilter = Arc<dyn Fn(&RegistryEvent) -> bool + Send + Sync>;

/// Turns a registry watch into a channel of triggers.
pub struct EventStream {
    registry: Registry,
    config: EventStreamConfig,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            config: EventStreamConfig::default(),
            filter: None,
        }
    }

    pub fn with_config(mut self, config: EventStreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Only forward events for which `filter` returns true.
    pub fn with_filter(mut self, filter: impl Fn(&RegistryEvent) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Start the stream. It stops when `shutdown` flips to true or the
    /// receiver is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (mpsc::Receiver<Trigger>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<Trigger>, mut shutdown: watch::Receiver<bool>) {
        info!("Event stream started");
        let mut last_index: Option<u64> = None;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            let mut kv_watch = match self.registry.watch(last_index).await {
                Ok(w) => w,
                Err(KvError::IndexCleared { requested, oldest }) => {
                    warn!(requested, oldest, "Watch index cleared, requesting full reconcile");
                    last_index = None;
                    if tx.send(Trigger::FullReconcile).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open registry watch");
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            debug!(after_index = ?last_index, "Registry watch opened");

            loop {
                let first = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                        continue;
                    }
                    next = kv_watch.next() => next,
                };

                let (batch, failure) = match first {
                    Ok(event) => self.collect(kv_watch.as_mut(), event).await,
                    Err(e) => (Vec::new(), Some(e)),
                };

                if let Some(last) = batch.last() {
                    last_index = Some(last.index);
                }
                if let Some(trigger) = self.coalesce(&batch) {
                    if tx.send(trigger).await.is_err() {
                        break 'outer;
                    }
                }

                match failure {
                    None => {}
                    Some(KvError::IndexCleared { requested, oldest }) => {
                        warn!(requested, oldest, "Watch index cleared, requesting full reconcile");
                        last_index = None;
                        if tx.send(Trigger::FullReconcile).await.is_err() {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                    Some(e) => {
                        warn!(error = %e, after_index = ?last_index, "Registry watch failed");
                        if self.pause(&mut shutdown).await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                }
            }
        }

        info!("Event stream stopped");
    }

    /// Gather events arriving within the coalescing window after `first`.
    async fn collect(&self, kv_watch: &mut dyn KvWatch, first: KvEvent) -> (Vec<KvEvent>, Option<KvError>) {
        let deadline = Instant::now() + self.config.coalesce_window;
        let mut batch = vec![first];
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return (batch, None),
                next = kv_watch.next() => match next {
                    Ok(event) => batch.push(event),
                    Err(e) => return (batch, Some(e)),
                },
            }
        }
    }

    /// Classify and deduplicate a raw batch. Returns `None` if nothing in it
    /// is of interest.
    fn coalesce(&self, batch: &[KvEvent]) -> Option<Trigger> {
        let keys = self.registry.keys();
        let mut latest: HashMap<&str, ObservedEvent> = HashMap::new();
        for raw in batch {
            let Some(event) = classify(keys, raw) else {
                continue;
            };
            if self.filter.as_ref().is_some_and(|f| !f(&event)) {
                continue;
            }
            latest.insert(raw.key.as_str(), ObservedEvent::new(raw.index, raw.key.clone(), event));
        }
        if latest.is_empty() {
            return None;
        }

        let mut events: Vec<ObservedEvent> = latest.into_values().collect();
        events.sort_by_key(|e| e.index);
        debug!(raw = batch.len(), events = events.len(), "Coalesced registry events");
        Some(Trigger::Events(events))
    }

    /// Sleep for the retry delay. Returns true if shutdown was requested.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_delay) => *shutdown.borrow(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}

/// Classify a raw KV change. Returns `None` for keys and changes that carry
/// no scheduling meaning (blobs, leases, refreshes with an unchanged value).
pub fn classify(keys: &KeyLayout, event: &KvEvent) -> Option<RegistryEvent> {
    let removed = event.action.is_removal();
    let created = !removed && event.prev_value.is_none();
    let changed = removed || event.value != event.prev_value;

    match keys.parse(&event.key)? {
        ParsedKey::UnitObject(unit) if removed => Some(RegistryEvent::UnitDestroyed { unit }),
        ParsedKey::UnitObject(unit) if created => Some(RegistryEvent::UnitCreated { unit }),
        ParsedKey::UnitTarget(unit) if changed => Some(RegistryEvent::ScheduleChanged {
            unit,
            machine: if removed { None } else { machine_in(event.value.as_deref()) },
        }),
        ParsedKey::UnitTargetState(unit) if changed => {
            Some(RegistryEvent::TargetStateChanged { unit })
        }
        ParsedKey::UnitHeartbeat(unit) if changed => Some(RegistryEvent::UnitStateChanged {
            unit,
            machine: machine_in(event.value.as_deref())
                .or_else(|| machine_in(event.prev_value.as_deref())),
        }),
        ParsedKey::MachineObject(machine) if removed => Some(RegistryEvent::MachineLost { machine }),
        ParsedKey::MachineObject(machine) if created => {
            Some(RegistryEvent::MachineCreated { machine })
        }
        ParsedKey::UnitState(unit, machine) if changed => Some(RegistryEvent::UnitStateChanged {
            unit,
            machine: Some(machine),
        }),
        _ => None,
    }
}

fn machine_in(value: Option<&[u8]>) -> Option<MachineId> {
    let raw = std::str::from_utf8(value?).ok()?;
    MachineId::parse(raw.trim()).ok()
}
