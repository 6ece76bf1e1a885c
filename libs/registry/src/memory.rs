//! In-process KV store.
//!
//! A single mutex serialises every operation, which makes the store
//! linearizable. TTL expiry is applied lazily at the start of every
//! operation (and on [`MemoryStore::purge_expired`]); each expiry consumes
//! an index and is delivered to watchers like any other removal.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::kv::{
    Condition, KvAction, KvEntry, KvError, KvEvent, KvResult, KvStore, KvWatch, PutOptions,
};

/// Number of events retained for watch resumption.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

struct Inner {
    entries: BTreeMap<String, KvEntry>,
    index: u64,
    history: VecDeque<KvEvent>,
    history_limit: usize,
    available: bool,
}

/// In-memory KV store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<KvEvent>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a store retaining `limit` events for watchers. Watchers that
    /// fall further behind observe `IndexCleared`.
    pub fn with_history_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        let (events, _) = broadcast::channel(limit);
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                index: 0,
                history: VecDeque::with_capacity(limit),
                history_limit: limit,
                available: true,
            }),
            events,
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Apply pending TTL expirations now.
    pub fn purge_expired(&self) {
        let mut inner = self.lock();
        self.expire(&mut inner, Instant::now());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock, check availability and apply expirations.
    fn begin(&self) -> KvResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        if !inner.available {
            return Err(KvError::Unavailable("memory store marked unavailable".to_string()));
        }
        self.expire(&mut inner, Instant::now());
        Ok(inner)
    }

    fn expire(&self, inner: &mut Inner, now: Instant) {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                debug!(key = %key, "Key expired");
                self.record(inner, KvAction::Expire, key, None, Some(entry.value));
            }
        }
    }

    fn record(
        &self,
        inner: &mut Inner,
        action: KvAction,
        key: String,
        value: Option<Vec<u8>>,
        prev_value: Option<Vec<u8>>,
    ) -> u64 {
        inner.index += 1;
        let event = KvEvent {
            index: inner.index,
            action,
            key,
            value,
            prev_value,
        };
        if inner.history.len() == inner.history_limit {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        // No receivers is fine.
        let _ = self.events.send(event);
        inner.index
    }

    fn check(key: &str, existing: Option<&KvEntry>, condition: &Condition) -> KvResult<()> {
        let failed = |reason: String| KvError::PreconditionFailed {
            key: key.to_string(),
            reason,
        };
        match (condition, existing) {
            (Condition::None, _) => Ok(()),
            (Condition::MustNotExist, Some(_)) => Err(KvError::AlreadyExists(key.to_string())),
            (Condition::MustNotExist, None) => Ok(()),
            (Condition::PrevIndex(0), _) => Err(failed("index 0 never matches".to_string())),
            (_, None) => Err(KvError::NotFound(key.to_string())),
            (Condition::MustExist, Some(_)) => Ok(()),
            (Condition::PrevIndex(idx), Some(entry)) if entry.modified_index != *idx => Err(failed(
                format!("index is {}, expected {}", entry.modified_index, idx),
            )),
            (Condition::PrevValue(value), Some(entry)) if entry.value != *value => {
                Err(failed("value mismatch".to_string()))
            }
            (Condition::PrevIndex(_) | Condition::PrevValue(_), Some(_)) => Ok(()),
        }
    }

    fn put_locked(
        &self,
        inner: &mut Inner,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
        now: Instant,
    ) -> KvResult<KvEntry> {
        let existing = inner.entries.get(key);
        Self::check(key, existing, &options.condition)?;

        let action = match (&options.condition, existing) {
            (Condition::MustNotExist, _) => KvAction::Create,
            (Condition::MustExist, _) => KvAction::Update,
            (Condition::PrevIndex(_) | Condition::PrevValue(_), _) => KvAction::CompareAndSwap,
            (Condition::None, Some(_)) => KvAction::Set,
            (Condition::None, None) => KvAction::Create,
        };
        let prev_value = existing.map(|e| e.value.clone());
        let created_index = existing.map(|e| e.created_index);

        let index = self.record(inner, action, key.to_string(), Some(value.clone()), prev_value);
        let entry = KvEntry {
            key: key.to_string(),
            value,
            created_index: created_index.unwrap_or(index),
            modified_index: index,
            expires_at: options.ttl.map(|ttl| now + ttl),
        };
        inner.entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<KvEntry>> {
        let inner = self.begin()?;
        Ok(inner.entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<KvEntry>> {
        let inner = self.begin()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> KvResult<KvEntry> {
        let mut inner = self.begin()?;
        self.put_locked(&mut inner, key, value, options, Instant::now())
    }

    async fn delete(&self, key: &str, condition: Condition) -> KvResult<KvEntry> {
        let mut inner = self.begin()?;
        Self::check(key, inner.entries.get(key), &condition)?;
        let Some(entry) = inner.entries.remove(key) else {
            return Err(KvError::NotFound(key.to_string()));
        };
        let action = match condition {
            Condition::PrevIndex(_) | Condition::PrevValue(_) => KvAction::CompareAndDelete,
            _ => KvAction::Delete,
        };
        self.record(&mut inner, action, key.to_string(), None, Some(entry.value.clone()));
        Ok(entry)
    }

    async fn delete_prefix(&self, prefix: &str) -> KvResult<usize> {
        let mut inner = self.begin()?;
        let keys: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                self.record(&mut inner, KvAction::Delete, key.clone(), None, Some(entry.value));
            }
        }
        Ok(keys.len())
    }

    async fn watch(&self, prefix: &str, after_index: Option<u64>) -> KvResult<Box<dyn KvWatch>> {
        let inner = self.begin()?;
        let after = after_index.unwrap_or(inner.index);

        if after < inner.index {
            let oldest = inner.history.front().map_or(inner.index + 1, |e| e.index);
            if after + 1 < oldest {
                return Err(KvError::IndexCleared {
                    requested: after,
                    oldest,
                });
            }
        }

        let backlog = inner
            .history
            .iter()
            .filter(|e| e.index > after && e.key.starts_with(prefix))
            .cloned()
            .collect();
        // Subscribing under the lock guarantees no event falls between the
        // backlog and the live feed.
        let receiver = self.events.subscribe();

        Ok(Box::new(MemoryWatch {
            prefix: prefix.to_string(),
            last_index: after,
            backlog,
            receiver,
        }))
    }

    async fn current_index(&self) -> KvResult<u64> {
        let inner = self.begin()?;
        Ok(inner.index)
    }
}

struct MemoryWatch {
    prefix: String,
    last_index: u64,
    backlog: VecDeque<KvEvent>,
    receiver: broadcast::Receiver<KvEvent>,
}

#[async_trait]
impl KvWatch for MemoryWatch {
    async fn next(&mut self) -> KvResult<KvEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_index = event.index;
            return Ok(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.index > self.last_index && event.key.starts_with(&self.prefix) => {
                    self.last_index = event.index;
                    return Ok(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Err(KvError::IndexCleared {
                        requested: self.last_index,
                        oldest: self.last_index + 1,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(KvError::Unavailable("watch feed closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn bytes(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryStore::new();
        store.put("/a/1", bytes("x"), PutOptions::default()).await.unwrap();
        store.put("/a/2", bytes("y"), PutOptions::default()).await.unwrap();
        store.put("/b/1", bytes("z"), PutOptions::default()).await.unwrap();

        let entry = store.get("/a/1").await.unwrap().unwrap();
        assert_eq!(entry.value, bytes("x"));
        let listed = store.list("/a/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.current_index().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_conditions() {
        let store = MemoryStore::new();
        let first = store
            .put("/k", bytes("1"), PutOptions::when(Condition::MustNotExist))
            .await
            .unwrap();
        assert_eq!(
            store.put("/k", bytes("2"), PutOptions::when(Condition::MustNotExist)).await,
            Err(KvError::AlreadyExists("/k".to_string()))
        );
        assert!(matches!(
            store.put("/k", bytes("2"), PutOptions::when(Condition::PrevIndex(first.modified_index + 7))).await,
            Err(KvError::PreconditionFailed { .. })
        ));
        assert!(matches!(
            store.put("/k", bytes("2"), PutOptions::when(Condition::PrevIndex(0))).await,
            Err(KvError::PreconditionFailed { .. })
        ));
        let second = store
            .put("/k", bytes("2"), PutOptions::when(Condition::PrevIndex(first.modified_index)))
            .await
            .unwrap();
        assert_eq!(second.created_index, first.created_index);
        assert!(second.modified_index > first.modified_index);

        assert_eq!(
            store.put("/missing", bytes("1"), PutOptions::when(Condition::MustExist)).await,
            Err(KvError::NotFound("/missing".to_string()))
        );
        assert!(matches!(
            store.delete("/k", Condition::PrevValue(bytes("1"))).await,
            Err(KvError::PreconditionFailed { .. })
        ));
        store.delete("/k", Condition::PrevValue(bytes("2"))).await.unwrap();
        assert_eq!(
            store.delete("/k", Condition::None).await,
            Err(KvError::NotFound("/k".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_is_observed() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/m/", None).await.unwrap();
        store
            .put("/m/a", bytes("a"), PutOptions::ttl(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(watch.next().await.unwrap().action, KvAction::Create);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("/m/a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("/m/a").await.unwrap().is_none());
        let event = watch.next().await.unwrap();
        assert_eq!(event.action, KvAction::Expire);
        assert_eq!(event.prev_value, Some(bytes("a")));
    }

    #[tokio::test]
    async fn test_watch_resumes_from_index() {
        let store = MemoryStore::new();
        let a = store.put("/w/a", bytes("1"), PutOptions::default()).await.unwrap();
        store.put("/other", bytes("1"), PutOptions::default()).await.unwrap();
        store.put("/w/b", bytes("1"), PutOptions::default()).await.unwrap();

        let mut watch = store.watch("/w/", Some(a.modified_index)).await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event.key, "/w/b");
    }

    #[tokio::test]
    async fn test_watch_index_cleared() {
        let store = MemoryStore::with_history_limit(2);
        for i in 0..5 {
            store.put(&format!("/k/{i}"), bytes("v"), PutOptions::default()).await.unwrap();
        }
        assert!(matches!(
            store.watch("/k/", Some(1)).await,
            Err(KvError::IndexCleared { requested: 1, .. })
        ));
        assert!(store.watch("/k/", Some(3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_watcher_sees_index_cleared() {
        let store = MemoryStore::with_history_limit(2);
        let mut watch = store.watch("/k/", None).await.unwrap();
        for i in 0..5 {
            store.put(&format!("/k/{i}"), bytes("v"), PutOptions::default()).await.unwrap();
        }
        assert!(matches!(watch.next().await, Err(KvError::IndexCleared { .. })));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.get("/k").await, Err(KvError::Unavailable(_))));
        store.set_available(true);
        assert!(store.get("/k").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = MemoryStore::new();
        store.put("/u/a/object", bytes("1"), PutOptions::default()).await.unwrap();
        store.put("/u/a/target", bytes("1"), PutOptions::default()).await.unwrap();
        store.put("/u/ab/object", bytes("1"), PutOptions::default()).await.unwrap();
        assert_eq!(store.delete_prefix("/u/a/").await.unwrap(), 2);
        assert_eq!(store.delete_prefix("/u/a/").await.unwrap(), 0);
        assert_eq!(store.list("/u/").await.unwrap().len(), 1);
    }
}
