//! Buffered "feature last evaluated" tracking.
//!
//! Ingest marks (feature, environment) pairs as seen; a periodic flush
//! writes each distinct pair once per cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::model::{FeatureUsage, LastSeenInput, LastSeenKey, DEFAULT_ENVIRONMENT};
use crate::store::LastSeenStore;

/// Collects last-seen marks between flushes.
pub struct LastSeenTracker<S> {
    store: Arc<S>,
    buffer: Mutex<HashMap<LastSeenKey, LastSeenInput>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: LastSeenStore> LastSeenTracker<S> {
    pub fn new(store: Arc<S>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            store,
            buffer: Mutex::new(HashMap::new()),
            health,
        }
    }

    /// Buffers every usage with activity whose key is not buffered yet.
    pub fn update_last_seen<'a>(&self, usages: impl IntoIterator<Item = &'a FeatureUsage>) {
        let mut buffer = self.buffer.lock();
        for usage in usages {
            if usage.yes == 0 && usage.no == 0 {
                continue;
            }

            let environment = if usage.environment.is_empty() {
                DEFAULT_ENVIRONMENT
            } else {
                usage.environment.as_str()
            };

            let key = LastSeenKey {
                feature_name: usage.feature_name.clone(),
                environment: environment.to_string(),
            };
            buffer.entry(key).or_insert_with(|| LastSeenInput {
                feature_name: usage.feature_name.clone(),
                environment: environment.to_string(),
            });
        }
    }

    /// Number of entries waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Writes the buffered entries in one store call and returns how many
    /// were taken. Store failures are logged; the taken batch is dropped.
    pub async fn store(&self) -> usize {
        let batch = std::mem::take(&mut *self.buffer.lock());
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        let started = Instant::now();
        let entries: Vec<LastSeenInput> = batch.into_values().collect();

        match self.store.set_last_seen(entries).await {
            Ok(()) => {
                debug!(entries = count, "last seen flushed");
                if let Some(health) = &self.health {
                    health.last_seen_flushed.inc_by(count as f64);
                }
            }
            Err(e) => {
                warn!(error = %e, entries = count, "storing last seen failed");
                if let Some(health) = &self.health {
                    health.record_store_error("set_last_seen");
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .flush_duration
                .with_label_values(&["last_seen"])
                .observe(started.elapsed().as_secs_f64());
        }

        count
    }

    /// Removes entries for features that no longer exist.
    pub async fn clean_last_seen(&self) -> anyhow::Result<()> {
        self.store.clean_last_seen().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryLastSeenStore;

    fn usage(feature: &str, environment: &str, yes: u64, no: u64) -> FeatureUsage {
        FeatureUsage {
            feature_name: feature.to_string(),
            environment: environment.to_string(),
            yes,
            no,
        }
    }

    #[tokio::test]
    async fn test_dedups_within_cycle() {
        let store = Arc::new(MemoryLastSeenStore::new());
        let tracker = LastSeenTracker::new(Arc::clone(&store), None);

        tracker.update_last_seen(&[
            usage("a", "production", 1, 0),
            usage("a", "production", 5, 5),
            usage("a", "development", 0, 1),
            usage("b", "production", 2, 0),
        ]);

        assert_eq!(tracker.pending(), 3);
        assert_eq!(tracker.store().await, 3);
        assert_eq!(store.len(), 3);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_inactive_usage_is_ignored() {
        let store = Arc::new(MemoryLastSeenStore::new());
        let tracker = LastSeenTracker::new(Arc::clone(&store), None);

        tracker.update_last_seen(&[usage("a", "production", 0, 0)]);

        assert_eq!(tracker.store().await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_environment_defaults() {
        let store = Arc::new(MemoryLastSeenStore::new());
        let tracker = LastSeenTracker::new(Arc::clone(&store), None);

        tracker.update_last_seen(&[usage("a", "", 1, 0)]);
        tracker.store().await;

        assert!(store.last_seen("a", DEFAULT_ENVIRONMENT).is_some());
    }

    #[tokio::test]
    async fn test_next_cycle_accepts_same_key() {
        let store = Arc::new(MemoryLastSeenStore::new());
        let tracker = LastSeenTracker::new(Arc::clone(&store), None);

        tracker.update_last_seen(&[usage("a", "production", 1, 0)]);
        assert_eq!(tracker.store().await, 1);

        tracker.update_last_seen(&[usage("a", "production", 1, 0)]);
        assert_eq!(tracker.store().await, 1);
    }
}
