//! The KV store contract the registry is layered on.
//!
//! The contract mirrors a strongly-consistent, watchable, TTL-capable store:
//! every mutation bumps a store-wide modification index, conditional writes
//! compare against the index or value of the existing key, and watches can
//! resume from any index still held in the store's history.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors reported by a KV store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("precondition failed for {key}: {reason}")]
    PreconditionFailed { key: String, reason: String },

    /// The requested watch index is older than the retained history.
    #[error("watch index {requested} cleared (oldest retained {oldest})")]
    IndexCleared { requested: u64, oldest: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Precondition attached to a write or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Condition {
    #[default]
    None,
    /// Fails with `AlreadyExists` if the key is present.
    MustNotExist,
    /// Fails with `NotFound` if the key is absent.
    MustExist,
    /// Key must exist with exactly this modification index. Index 0 never
    /// matches.
    PrevIndex(u64),
    /// Key must exist with exactly this value.
    PrevValue(Vec<u8>),
}

/// Options for [`KvStore::put`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    pub condition: Condition,
}

impl PutOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            condition: Condition::None,
        }
    }

    pub fn when(condition: Condition) -> Self {
        Self {
            ttl: None,
            condition,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_index: u64,
    pub modified_index: u64,
    pub expires_at: Option<Instant>,
}

impl KvEntry {
    /// Time left before the key expires; `None` for keys without a TTL.
    pub fn ttl_remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// What produced a [`KvEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    Create,
    Set,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl KvAction {
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Delete | Self::CompareAndDelete | Self::Expire)
    }
}

/// A change observed through a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub index: u64,
    pub action: KvAction,
    pub key: String,
    /// New value; `None` for removals.
    pub value: Option<Vec<u8>>,
    /// Value before the change, if the key existed.
    pub prev_value: Option<Vec<u8>>,
}

/// An open watch on a key prefix.
#[async_trait]
pub trait KvWatch: Send {
    /// Next change under the watched prefix, in index order.
    async fn next(&mut self) -> KvResult<KvEvent>;
}

/// Strongly-consistent KV store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<KvEntry>>;

    /// All live keys starting with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> KvResult<Vec<KvEntry>>;

    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> KvResult<KvEntry>;

    /// Delete one key. Fails with `NotFound` if the key is absent.
    async fn delete(&self, key: &str, condition: Condition) -> KvResult<KvEntry>;

    /// Delete every key under `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> KvResult<usize>;

    /// Watch `prefix` for changes with an index greater than `after_index`,
    /// or from now on when `None`.
    async fn watch(&self, prefix: &str, after_index: Option<u64>) -> KvResult<Box<dyn KvWatch>>;

    /// Current store-wide modification index.
    async fn current_index(&self) -> KvResult<u64>;
}
