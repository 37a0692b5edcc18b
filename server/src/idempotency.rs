use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::ProcessedEventStore;

/// Remembers which platform event ids were already accepted.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn ProcessedEventStore>,
    retention: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn ProcessedEventStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// True only for the first caller that presents `event_id` within the
    /// retention window.
    pub async fn accept(&self, event_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.store
            .insert_if_absent(event_id, now, now + retention)
            .await
    }

    /// Periodically deletes expired markers. Runs until the runtime shuts down.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.purge_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "purged expired processed-event markers"),
                    Err(err) => warn!(error = %err, "failed to purge processed-event markers"),
                }
            }
        })
    }
}
