//! Typed registry verbs.
//!
//! Every KV call carries a deadline. Idempotent verbs retry transport
//! failures with backoff; `create_unit`, `schedule_unit` and the lease verbs
//! surface the first failure.

mod leases;
mod machines;
mod schedule;
mod states;
mod units;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flotilla_reconcile::{RetryPolicy, DEFAULT_REQUEST_TIMEOUT};
use serde::de::DeserializeOwned;

use crate::keys::{KeyLayout, DEFAULT_KEY_PREFIX};
use crate::kv::{KvError, KvResult, KvStore, KvWatch};
use crate::pagination::{PageToken, DEFAULT_PAGE_LIMIT};
use crate::{RegistryError, RegistryResult};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub key_prefix: String,
    /// Deadline of a single KV call.
    pub request_timeout: Duration,
    /// Retry policy for idempotent verbs.
    pub retry: RetryPolicy,
    /// Page size of paginated listings.
    pub page_limit: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Typed access to cluster state.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    keys: KeyLayout,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            keys: KeyLayout::new(&config.key_prefix),
            config,
        }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Open a watch over every key under the prefix.
    ///
    /// Errors are returned as raw [`KvError`]s so callers can tell a cleared
    /// index apart from an unreachable store.
    pub async fn watch(&self, after_index: Option<u64>) -> KvResult<Box<dyn KvWatch>> {
        let root = self.keys.root();
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.store.watch(&root, after_index)).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Unavailable(format!(
                "watch: deadline of {timeout:?} exceeded"
            ))),
        }
    }

    /// Current KV modification index.
    pub async fn current_index(&self) -> RegistryResult<u64> {
        self.call("current_index", || self.store.current_index()).await
    }

    /// Run an idempotent KV call with a deadline and transport retries.
    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        self.run(operation, self.config.retry, op).await
    }

    /// Run a non-idempotent KV call with a deadline and no retries.
    async fn call_once<T, F, Fut>(&self, operation: &'static str, op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        self.run(operation, RetryPolicy::once(), op).await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        policy: RetryPolicy,
        mut op: F,
    ) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        let timeout = self.config.request_timeout;
        policy
            .retry(operation, RegistryError::is_retryable, || {
                let fut = op();
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result.map_err(RegistryError::from),
                        Err(_) => Err(RegistryError::Transport(format!(
                            "{operation}: deadline of {timeout:?} exceeded"
                        ))),
                    }
                }
            })
            .await
    }

    /// Resolve an optional page token against the configured page size.
    fn page_token(&self, token: Option<&str>) -> RegistryResult<PageToken> {
        match token {
            None => Ok(PageToken::first(self.config.page_limit)),
            Some(raw) => {
                let token = PageToken::decode(raw)?;
                token.validate(self.config.page_limit)?;
                Ok(token)
            }
        }
    }
}

fn decode_json<T: DeserializeOwned>(key: &str, value: &[u8]) -> RegistryResult<T> {
    serde_json::from_slice(value)
        .map_err(|e| RegistryError::Serialization(format!("{key}: {e}")))
}

fn decode_str<'a>(key: &str, value: &'a [u8]) -> RegistryResult<&'a str> {
    std::str::from_utf8(value)
        .map(str::trim)
        .map_err(|_| RegistryError::Serialization(format!("{key}: value is not UTF-8")))
}
