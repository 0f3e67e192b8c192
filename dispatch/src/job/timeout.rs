//! Expiry tracking for cached job records

use std::sync::Arc;

use labdash_shared::now_ms;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::store::JobStore;

/// Periodically deletes records whose TTL has run out
pub struct ExpiryTracker {
    store: Arc<dyn JobStore>,
    check_interval: Duration,
}

impl ExpiryTracker {
    /// Create a new expiry tracker
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            check_interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Purge once; returns the ids removed
    pub async fn sweep(&self) -> Vec<String> {
        match self.store.purge_expired(now_ms()).await {
            Ok(expired) => {
                if !expired.is_empty() {
                    debug!(count = expired.len(), "purged expired jobs");
                }
                expired
            }
            Err(e) => {
                warn!(error = %e, "expired job purge failed");
                Vec::new()
            }
        }
    }

    /// Start the purge loop. Never returns.
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}
