//! In-memory store implementations.
//!
//! Used by the binary when no external database is wired in, and by tests.
//! State lives behind `parking_lot` mutexes that are never held across an
//! await point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{
    Application, ApplicationCreatedEvent, ClientInstance, LastSeenInput, StoredReport, UsageReport,
};

use super::{ApplicationsStore, EventStore, InstanceStore, LastSeenStore, MetricsStore, Stores};

const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

fn cutoff(max_age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Default)]
struct MetricsState {
    next_id: i64,
    reports: Vec<StoredReport>,
}

/// Usage rows kept in insertion (= id) order.
#[derive(Default)]
pub struct MemoryMetricsStore {
    state: Mutex<MetricsState>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored reports.
    pub fn len(&self) -> usize {
        self.state.lock().reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsStore for MemoryMetricsStore {
    async fn batch_insert(&self, reports: Vec<UsageReport>) -> Result<Vec<i64>> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(reports.len());
        for report in reports {
            state.next_id += 1;
            let id = state.next_id;
            state.reports.push(StoredReport { id, report });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn get_metrics_last_hour(&self) -> Result<Vec<StoredReport>> {
        let since = cutoff(ONE_HOUR);
        Ok(self
            .state
            .lock()
            .reports
            .iter()
            .filter(|r| r.report.bucket.stop >= since)
            .cloned()
            .collect())
    }

    async fn get_new_metrics(&self, after_id: i64) -> Result<Vec<StoredReport>> {
        Ok(self
            .state
            .lock()
            .reports
            .iter()
            .filter(|r| r.id > after_id)
            .cloned()
            .collect())
    }

    async fn delete_older_than(&self, max_age: Duration) -> Result<u64> {
        let since = cutoff(max_age);
        let mut state = self.state.lock();
        let before = state.reports.len();
        state.reports.retain(|r| r.report.bucket.stop >= since);
        Ok((before - state.reports.len()) as u64)
    }
}

/// Application rows keyed by app name.
#[derive(Default)]
pub struct MemoryApplicationsStore {
    apps: Mutex<HashMap<String, Application>>,
}

impl MemoryApplicationsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_name: &str) -> Option<Application> {
        self.apps.lock().get(app_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.apps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ApplicationsStore for MemoryApplicationsStore {
    async fn bulk_upsert(&self, apps: Vec<Application>) -> Result<()> {
        let mut stored = self.apps.lock();
        for app in apps {
            match stored.get_mut(&app.app_name) {
                Some(existing) => {
                    // Announcement state and descriptive fields survive heartbeats.
                    existing.environment = app.environment.or(existing.environment.take());
                    existing.sdk_version = app.sdk_version.or(existing.sdk_version.take());
                    if !app.strategies.is_empty() {
                        existing.strategies = app.strategies;
                    }
                }
                None => {
                    stored.insert(app.app_name.clone(), app);
                }
            }
        }
        Ok(())
    }

    async fn get_unannounced(&self) -> Result<Vec<Application>> {
        Ok(self
            .apps
            .lock()
            .values()
            .filter(|a| !a.announced)
            .cloned()
            .collect())
    }

    async fn set_unannounced_to_announced(&self) -> Result<Vec<Application>> {
        let mut flipped = Vec::new();
        for app in self.apps.lock().values_mut() {
            if !app.announced {
                app.announced = true;
                flipped.push(app.clone());
            }
        }
        flipped.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        Ok(flipped)
    }
}

/// Instance rows keyed by (app name, instance id).
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: Mutex<HashMap<(String, String), ClientInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InstanceStore for MemoryInstanceStore {
    async fn bulk_upsert(&self, instances: Vec<ClientInstance>) -> Result<()> {
        let mut stored = self.instances.lock();
        for instance in instances {
            let key = (instance.app_name.clone(), instance.instance_id.clone());
            stored.insert(key, instance);
        }
        Ok(())
    }

    async fn get_by_app_name(&self, app_name: &str) -> Result<Vec<ClientInstance>> {
        let mut found: Vec<ClientInstance> = self
            .instances
            .lock()
            .values()
            .filter(|i| i.app_name == app_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(found)
    }

    async fn delete_for_application(&self, app_name: &str) -> Result<()> {
        self.instances
            .lock()
            .retain(|(app, _), _| app.as_str() != app_name);
        Ok(())
    }
}

#[derive(Default)]
struct LastSeenState {
    seen: HashMap<LastSeenInput, DateTime<Utc>>,
    known_features: Option<HashSet<String>>,
}

/// Last-seen timestamps keyed by (feature, environment).
#[derive(Default)]
pub struct MemoryLastSeenStore {
    state: Mutex<LastSeenState>,
}

impl MemoryLastSeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the feature catalogue used by `clean_last_seen`. Without a
    /// catalogue every feature is considered known.
    pub fn set_known_features(&self, features: impl IntoIterator<Item = String>) {
        self.state.lock().known_features = Some(features.into_iter().collect());
    }

    pub fn last_seen(&self, feature_name: &str, environment: &str) -> Option<DateTime<Utc>> {
        let key = LastSeenInput {
            feature_name: feature_name.to_string(),
            environment: environment.to_string(),
        };
        self.state.lock().seen.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LastSeenStore for MemoryLastSeenStore {
    async fn set_last_seen(&self, entries: Vec<LastSeenInput>) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        for entry in entries {
            state.seen.insert(entry, now);
        }
        Ok(())
    }

    async fn clean_last_seen(&self) -> Result<()> {
        let mut state = self.state.lock();
        let LastSeenState {
            seen,
            known_features,
        } = &mut *state;
        if let Some(known) = known_features {
            seen.retain(|entry, _| known.contains(&entry.feature_name));
        }
        Ok(())
    }
}

/// Application-created events in arrival order, with the batch boundaries.
#[derive(Default)]
pub struct MemoryEventStore {
    batches: Mutex<Vec<Vec<ApplicationCreatedEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ApplicationCreatedEvent> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

impl EventStore for MemoryEventStore {
    async fn batch_store(&self, events: Vec<ApplicationCreatedEvent>) -> Result<()> {
        self.batches.lock().push(events);
        Ok(())
    }
}

/// All in-memory stores bundled for the service.
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub metrics: Arc<MemoryMetricsStore>,
    pub applications: Arc<MemoryApplicationsStore>,
    pub instances: Arc<MemoryInstanceStore>,
    pub last_seen: Arc<MemoryLastSeenStore>,
    pub events: Arc<MemoryEventStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stores for MemoryStores {
    type Metrics = MemoryMetricsStore;
    type Applications = MemoryApplicationsStore;
    type Instances = MemoryInstanceStore;
    type LastSeen = MemoryLastSeenStore;
    type Events = MemoryEventStore;

    fn metrics(&self) -> Arc<Self::Metrics> {
        Arc::clone(&self.metrics)
    }

    fn applications(&self) -> Arc<Self::Applications> {
        Arc::clone(&self.applications)
    }

    fn instances(&self) -> Arc<Self::Instances> {
        Arc::clone(&self.instances)
    }

    fn last_seen(&self) -> Arc<Self::LastSeen> {
        Arc::clone(&self.last_seen)
    }

    fn events(&self) -> Arc<Self::Events> {
        Arc::clone(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::MetricsBucket;

    fn report(app: &str, stop: DateTime<Utc>) -> UsageReport {
        UsageReport {
            app_name: app.to_string(),
            instance_id: None,
            environment: None,
            sdk_version: None,
            bucket: MetricsBucket {
                start: stop,
                stop,
                toggles: HashMap::new(),
            },
        }
    }

    fn app(name: &str) -> Application {
        Application {
            app_name: name.to_string(),
            environment: None,
            sdk_version: None,
            strategies: Vec::new(),
            description: None,
            url: None,
            color: None,
            icon: None,
            created_by: None,
            announced: false,
        }
    }

    #[tokio::test]
    async fn test_metrics_store_ids_increase() {
        let store = MemoryMetricsStore::new();
        let ids = store
            .batch_insert(vec![report("a", Utc::now()), report("b", Utc::now())])
            .await
            .expect("insert");
        assert_eq!(ids.len(), 2);
        let (a, b) = (ids[0], ids[1]);
        assert!(b > a);

        let newer = store.get_new_metrics(a).await.expect("query");
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].report.app_name, "b");
    }

    #[tokio::test]
    async fn test_metrics_store_last_hour_and_delete() {
        let store = MemoryMetricsStore::new();
        let old = Utc::now() - chrono::Duration::hours(3);
        store
            .batch_insert(vec![report("old", old), report("new", Utc::now())])
            .await
            .expect("insert");

        let recent = store.get_metrics_last_hour().await.expect("query");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].report.app_name, "new");

        let removed = store
            .delete_older_than(Duration::from_secs(2 * 60 * 60))
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_applications_announce_once() {
        let store = MemoryApplicationsStore::new();
        store
            .bulk_upsert(vec![app("a"), app("b")])
            .await
            .expect("upsert");

        let first = store.set_unannounced_to_announced().await.expect("flip");
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|a| a.announced));

        // A heartbeat must not reset the announced flag.
        store.bulk_upsert(vec![app("a")]).await.expect("upsert");
        let second = store.set_unannounced_to_announced().await.expect("flip");
        assert!(second.is_empty());
        assert!(store.get_unannounced().await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_last_seen_clean_uses_catalogue() {
        let store = MemoryLastSeenStore::new();
        store
            .set_last_seen(vec![
                LastSeenInput {
                    feature_name: "kept".to_string(),
                    environment: "default".to_string(),
                },
                LastSeenInput {
                    feature_name: "archived".to_string(),
                    environment: "default".to_string(),
                },
            ])
            .await
            .expect("set");

        store.clean_last_seen().await.expect("clean");
        assert_eq!(store.len(), 2);

        store.set_known_features(["kept".to_string()]);
        store.clean_last_seen().await.expect("clean");
        assert_eq!(store.len(), 1);
        assert!(store.last_seen("kept", "default").is_some());
    }
}
