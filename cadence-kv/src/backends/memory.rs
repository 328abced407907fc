//! In-memory KV backend.
//!
//! Every operation takes the single mutex, which gives it the same
//! atomicity guarantees as the Redis backend's server-side scripts. Used by
//! the whole workspace's tests and usable for single-process deployments.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::{KvError, Result},
    kv::{CounterOutcome, CounterSpec, KvStore},
};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A process-local [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn parse_counter(key: &str, value: &str) -> Result<u64> {
        value.parse::<u64>().map_err(|e| KvError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if Self::live_value(&mut entries, key, now).as_deref() == Some(value) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn check_and_increment(
        &self,
        counters: &[CounterSpec],
        amount: u64,
    ) -> Result<CounterOutcome> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        // Check every window first; nothing is written on a denial.
        for (index, spec) in counters.iter().enumerate() {
            let current = match Self::live_value(&mut entries, &spec.key, now) {
                Some(value) => Self::parse_counter(&spec.key, &value)?,
                None => 0,
            };
            if current + amount > spec.limit {
                return Ok(CounterOutcome::Denied { index });
            }
        }

        for spec in counters {
            match Self::live_value(&mut entries, &spec.key, now) {
                Some(value) => {
                    let next = Self::parse_counter(&spec.key, &value)? + amount;
                    if let Some(entry) = entries.get_mut(&spec.key) {
                        entry.value = next.to_string();
                    }
                }
                None => {
                    entries.insert(
                        spec.key.clone(),
                        Entry {
                            value: amount.to_string(),
                            expires_at: Some(now + spec.ttl),
                        },
                    );
                }
            }
        }

        Ok(CounterOutcome::Allowed)
    }

    async fn increment_ex(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let next = match Self::live_value(&mut entries, key, now) {
            Some(value) => Self::parse_counter(key, &value)? + amount,
            None => amount,
        };
        let expires_at = match entries.get(key) {
            Some(existing) => existing.expires_at,
            None => Some(now + ttl),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn counter_value(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.lock();
        match Self::live_value(&mut entries, key, Instant::now()) {
            Some(value) => Self::parse_counter(key, &value),
            None => Ok(0),
        }
    }

    async fn scan_prefix(&self, prefix: &str, _batch_hint: usize) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<u64> {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn spec(key: &str, limit: u64) -> CounterSpec {
        CounterSpec::new(key, limit, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn set_nx_only_wins_once() {
        let kv = MemoryKv::new();
        assert!(
            kv.set_nx_ex("lock", "a", Duration::from_secs(5))
                .await
                .unwrap()
        );
        assert!(
            !kv.set_nx_ex("lock", "b", Duration::from_secs(5))
                .await
                .unwrap()
        );
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fenced_delete_requires_matching_value() {
        let kv = MemoryKv::new();
        kv.set_ex("lock", "token-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!kv.delete_if_equals("lock", "token-2").await.unwrap());
        assert!(kv.delete_if_equals("lock", "token-1").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn denied_step_leaves_all_counters_untouched() {
        let kv = MemoryKv::new();
        let counters = [spec("a", 10), spec("b", 2), spec("c", 10)];

        assert_eq!(
            kv.check_and_increment(&counters, 2).await.unwrap(),
            CounterOutcome::Allowed
        );
        // b is now at its cap; the next step must fail on index 1 and leave
        // a and c unchanged.
        assert_eq!(
            kv.check_and_increment(&counters, 1).await.unwrap(),
            CounterOutcome::Denied { index: 1 }
        );
        assert_eq!(kv.counter_value("a").await.unwrap(), 2);
        assert_eq!(kv.counter_value("b").await.unwrap(), 2);
        assert_eq!(kv.counter_value("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_the_limit() {
        let kv = Arc::new(MemoryKv::new());
        let limit = 50;

        let mut handles = Vec::new();
        for _ in 0..200 {
            let kv = Arc::clone(&kv);
            handles.push(tokio::spawn(async move {
                let counters = [CounterSpec::new("shared", limit, Duration::from_secs(60))];
                kv.check_and_increment(&counters, 1).await.unwrap()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.expect("task panicked").is_allowed() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, limit);
        assert_eq!(kv.counter_value("shared").await.unwrap(), limit);
    }

    #[tokio::test]
    async fn scan_and_batch_delete() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.set_ex(&format!("agent:decisions:c1:{i}"), "{}", Duration::from_secs(60))
                .await
                .unwrap();
        }
        kv.set_ex("other:key", "{}", Duration::from_secs(60))
            .await
            .unwrap();

        let keys = kv.scan_prefix("agent:decisions:c1:", 500).await.unwrap();
        assert_eq!(keys.len(), 5);

        assert_eq!(kv.delete_batch(&keys).await.unwrap(), 5);
        assert!(
            kv.scan_prefix("agent:decisions:c1:", 500)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(kv.get("other:key").await.unwrap().is_some());
    }
}
