//! The [`KvStore`] trait: the contract every backend satisfies.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{KvError, Result};

/// One counter participating in an atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSpec {
    /// Full key, bucket included (e.g. `ratelimit:sendgrid:sec:1719848400`).
    pub key: String,
    /// Inclusive cap for the counter's window.
    pub limit: u64,
    /// Expiry applied when the counter is created; slightly longer than the
    /// window it covers.
    pub ttl: Duration,
}

impl CounterSpec {
    /// Convenience constructor.
    #[must_use]
    pub fn new(key: impl Into<String>, limit: u64, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            limit,
            ttl,
        }
    }
}

/// Result of an atomic multi-counter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    /// Every counter was below its limit; all were incremented.
    Allowed,
    /// The counter at `index` (into the input slice) would have exceeded its
    /// limit; nothing was incremented.
    Denied { index: usize },
}

impl CounterOutcome {
    /// Whether the step was allowed.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Uniform interface over the fast KV store.
///
/// Implementations must guarantee that [`check_and_increment`] executes as
/// one atomic step on the backend: no interleaving of concurrent callers may
/// push any counter past its limit, and a denied call leaves every counter
/// untouched.
///
/// [`check_and_increment`]: KvStore::check_and_increment
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value with an expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write only when the key is absent. Returns whether the write won.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove a key only when it still holds `value` (fenced delete).
    /// Returns whether the key was removed.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// Atomically check every counter against its limit and, only when all
    /// pass, increment them all by `amount`.
    async fn check_and_increment(
        &self,
        counters: &[CounterSpec],
        amount: u64,
    ) -> Result<CounterOutcome>;

    /// Unconditionally increment a counter, creating it with `ttl` when
    /// absent. Returns the post-increment value.
    async fn increment_ex(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64>;

    /// Current value of a counter; absent counts as zero.
    async fn counter_value(&self, key: &str) -> Result<u64>;

    /// Collect every key under `prefix` using cursor-based scans of
    /// `batch_hint` keys at a time.
    async fn scan_prefix(&self, prefix: &str, batch_hint: usize) -> Result<Vec<String>>;

    /// Delete a batch of keys in one backend round-trip. Returns the number
    /// actually removed.
    async fn delete_batch(&self, keys: &[String]) -> Result<u64>;
}

/// Read and decode a JSON value.
///
/// # Errors
///
/// Returns [`KvError::Decode`] when the stored payload is not valid JSON for
/// `T`, or the backend's error otherwise.
pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Encode and write a JSON value with an expiry.
///
/// # Errors
///
/// Returns the backend's error on write failure.
pub async fn put_json<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let raw = serde_json::to_string(value).map_err(|e| KvError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    kv.set_ex(key, &raw, ttl).await
}
