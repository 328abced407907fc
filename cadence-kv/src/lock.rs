//! Named, TTL-bounded mutual exclusion across processes.
//!
//! Acquisition is an atomic set-if-absent carrying a per-holder fencing
//! token; release deletes the key only when the token still matches, so a
//! holder whose TTL lapsed can never release a successor's lock. When the
//! KV store is unreachable the manager falls back to a relational advisory
//! lock, preferring degraded mutual exclusion over none.

use std::{sync::Arc, time::Duration};

use tracing::warn;

use crate::{
    error::{KvError, Result},
    kv::KvStore,
};

/// Backend that actually holds a given lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Kv,
    Advisory,
}

/// Proof of lock ownership, consumed by [`LockManager::release`].
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    token: String,
    backend: Backend,
}

impl LockHandle {
    /// The lock's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fencing token minted at acquisition.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Advisory-lock fallback, implemented by the relational store.
#[async_trait::async_trait]
pub trait AdvisoryLocker: Send + Sync {
    /// Try to take the advisory lock for `name`. Non-blocking.
    async fn try_advisory_lock(&self, name: &str) -> Result<bool>;

    /// Release the advisory lock for `name`.
    async fn release_advisory_lock(&self, name: &str) -> Result<()>;
}

/// Acquires and releases named locks for this process.
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    fallback: Option<Arc<dyn AdvisoryLocker>>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// A manager with no advisory fallback.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, fallback: None }
    }

    /// A manager that degrades to the advisory locker on KV outage.
    #[must_use]
    pub fn with_fallback(kv: Arc<dyn KvStore>, fallback: Arc<dyn AdvisoryLocker>) -> Self {
        Self {
            kv,
            fallback: Some(fallback),
        }
    }

    fn key(name: &str) -> String {
        format!("lock:{name}")
    }

    /// Try to acquire `name` for `ttl`.
    ///
    /// Returns `None` when another holder has the lock. A KV outage is not
    /// contention: it falls through to the advisory backend when one is
    /// configured, and only then surfaces the error.
    ///
    /// # Errors
    ///
    /// Returns the KV error when the store is unreachable and no fallback
    /// is configured (or the fallback failed too).
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let token = ulid::Ulid::new().to_string();

        match self.kv.set_nx_ex(&Self::key(name), &token, ttl).await {
            Ok(true) => Ok(Some(LockHandle {
                name: name.to_string(),
                token,
                backend: Backend::Kv,
            })),
            Ok(false) => Ok(None),
            Err(kv_error) => {
                let Some(fallback) = &self.fallback else {
                    return Err(kv_error);
                };
                warn!(
                    lock = name,
                    error = %kv_error,
                    "KV lock unavailable, falling back to advisory lock"
                );
                if fallback.try_advisory_lock(name).await? {
                    Ok(Some(LockHandle {
                        name: name.to_string(),
                        token,
                        backend: Backend::Advisory,
                    }))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Release a held lock.
    ///
    /// Returns whether this call actually removed the lock; `false` means
    /// the TTL already lapsed and someone else may hold it now.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when the release command fails.
    pub async fn release(&self, handle: LockHandle) -> Result<bool> {
        match handle.backend {
            Backend::Kv => {
                self.kv
                    .delete_if_equals(&Self::key(&handle.name), &handle.token)
                    .await
            }
            Backend::Advisory => {
                let Some(fallback) = &self.fallback else {
                    return Err(KvError::Backend(
                        "advisory lock held but no fallback configured".to_string(),
                    ));
                };
                fallback.release_advisory_lock(&handle.name).await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryKv;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn second_acquire_is_refused() {
        let locks = manager();
        let held = locks
            .acquire("campaign:1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(held.is_some());
        assert!(
            locks
                .acquire("campaign:1", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn release_frees_the_name() {
        let locks = manager();
        let handle = locks
            .acquire("campaign:2", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("first acquire");
        assert!(locks.release(handle).await.unwrap());
        assert!(
            locks
                .acquire("campaign:2", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn release_after_expiry_is_fenced() {
        let locks = manager();
        let stale = locks
            .acquire("campaign:3", Duration::from_millis(1))
            .await
            .unwrap()
            .expect("first acquire");

        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second process takes over after the TTL lapses.
        let fresh = locks
            .acquire("campaign:3", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // The stale holder's release must not remove the new holder's lock.
        assert!(!locks.release(stale).await.unwrap());
        assert!(
            locks
                .acquire("campaign:3", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn distinct_names_are_independent() {
        let locks = manager();
        assert!(
            locks
                .acquire("campaign:a", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            locks
                .acquire("campaign:b", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }
}
