//! The global suppression hub.
//!
//! One in-memory set of normalized addresses, consulted on every send with
//! an O(1) lookup. The durable set lives in the relational store; the hub
//! loads it at startup and refreshes on an interval, so a newly suppressed
//! address stops receiving mail within one refresh period.

use std::{sync::Arc, time::Duration};

use ahash::AHashSet;
use parking_lot::RwLock;
use tracing::{debug, error};

use cadence_common::{EmailAddress, Signal};
use cadence_store::{StoreError, SuppressionStore};

const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// In-process mirror of the global suppression set.
pub struct SuppressionHub {
    store: Arc<dyn SuppressionStore>,
    set: RwLock<AHashSet<String>>,
}

impl std::fmt::Debug for SuppressionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuppressionHub")
            .field("entries", &self.set.read().len())
            .finish_non_exhaustive()
    }
}

impl SuppressionHub {
    /// An empty hub; call [`reload`] before serving traffic.
    ///
    /// [`reload`]: SuppressionHub::reload
    #[must_use]
    pub fn new(store: Arc<dyn SuppressionStore>) -> Self {
        Self {
            store,
            set: RwLock::new(AHashSet::new()),
        }
    }

    /// Replace the in-memory set with the store's current truth.
    ///
    /// # Errors
    ///
    /// Returns the store error; the previous set stays in effect.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let addresses = self.store.load_global_suppression().await?;
        let fresh: AHashSet<String> = addresses.into_iter().collect();
        let count = fresh.len();
        *self.set.write() = fresh;
        debug!(count, "global suppression set reloaded");
        Ok(count)
    }

    /// Whether `address` is globally suppressed.
    #[must_use]
    pub fn is_suppressed(&self, address: &EmailAddress) -> bool {
        self.set.read().contains(address.as_str())
    }

    /// Number of suppressed addresses currently loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }

    /// Refresh the set until shutdown.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(REFRESH_INTERVAL);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.reload().await {
                        error!("suppression reload failed: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(_) => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cadence_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn lookup_reflects_loaded_set() {
        let store = Arc::new(MemoryStore::new());
        store.add_global_suppression("Blocked@Example.com ");
        let hub = SuppressionHub::new(Arc::clone(&store) as Arc<dyn SuppressionStore>);

        let blocked = EmailAddress::parse("blocked@example.com").unwrap();
        assert!(!hub.is_suppressed(&blocked), "empty before reload");

        assert_eq!(hub.reload().await.unwrap(), 1);
        assert!(hub.is_suppressed(&blocked));
        assert!(!hub.is_suppressed(&EmailAddress::parse("ok@example.com").unwrap()));
    }

    #[tokio::test]
    async fn reload_replaces_rather_than_accumulates() {
        let store = Arc::new(MemoryStore::new());
        store.add_global_suppression("a@example.com");
        let hub = SuppressionHub::new(Arc::clone(&store) as Arc<dyn SuppressionStore>);
        hub.reload().await.unwrap();
        assert_eq!(hub.len(), 1);

        // The durable set changed out from under us; reload converges.
        store.add_global_suppression("b@example.com");
        hub.reload().await.unwrap();
        assert_eq!(hub.len(), 2);
    }
}
