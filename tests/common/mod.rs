#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use flagwatch::model::{
    Application, ApplicationCreatedEvent, ClientInstance, ClientRegistration, LastSeenInput,
    MetricsBucket, StoredReport, ToggleCounts, UsageReport,
};
use flagwatch::store::memory::{
    MemoryApplicationsStore, MemoryInstanceStore, MemoryLastSeenStore, MemoryMetricsStore,
};
use flagwatch::store::{
    ApplicationsStore, EventStore, InstanceStore, LastSeenStore, MetricsStore, Stores,
};

/// Failure switch shared by the recording stores.
#[derive(Default)]
pub struct Failure(AtomicBool);

impl Failure {
    pub fn set(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            bail!("{operation}: injected failure");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMetricsStore {
    pub inner: MemoryMetricsStore,
    pub batches: Mutex<Vec<Vec<UsageReport>>>,
    pub failure: Failure,
}

impl MetricsStore for RecordingMetricsStore {
    async fn batch_insert(&self, reports: Vec<UsageReport>) -> Result<Vec<i64>> {
        self.batches.lock().push(reports.clone());
        self.failure.check("batch_insert")?;
        self.inner.batch_insert(reports).await
    }

    async fn get_metrics_last_hour(&self) -> Result<Vec<StoredReport>> {
        self.failure.check("get_metrics_last_hour")?;
        self.inner.get_metrics_last_hour().await
    }

    async fn get_new_metrics(&self, after_id: i64) -> Result<Vec<StoredReport>> {
        self.failure.check("get_new_metrics")?;
        self.inner.get_new_metrics(after_id).await
    }

    async fn delete_older_than(&self, max_age: Duration) -> Result<u64> {
        self.failure.check("delete_older_than")?;
        self.inner.delete_older_than(max_age).await
    }
}

#[derive(Default)]
pub struct RecordingApplicationsStore {
    pub inner: MemoryApplicationsStore,
    pub upserts: Mutex<Vec<Vec<Application>>>,
    pub failure: Failure,
}

impl ApplicationsStore for RecordingApplicationsStore {
    async fn bulk_upsert(&self, apps: Vec<Application>) -> Result<()> {
        self.upserts.lock().push(apps.clone());
        self.failure.check("applications bulk_upsert")?;
        self.inner.bulk_upsert(apps).await
    }

    async fn get_unannounced(&self) -> Result<Vec<Application>> {
        self.inner.get_unannounced().await
    }

    async fn set_unannounced_to_announced(&self) -> Result<Vec<Application>> {
        self.failure.check("set_unannounced_to_announced")?;
        self.inner.set_unannounced_to_announced().await
    }
}

#[derive(Default)]
pub struct RecordingInstanceStore {
    pub inner: MemoryInstanceStore,
    pub upserts: Mutex<Vec<Vec<ClientInstance>>>,
    pub failure: Failure,
}

impl InstanceStore for RecordingInstanceStore {
    async fn bulk_upsert(&self, instances: Vec<ClientInstance>) -> Result<()> {
        self.upserts.lock().push(instances.clone());
        self.failure.check("instances bulk_upsert")?;
        self.inner.bulk_upsert(instances).await
    }

    async fn get_by_app_name(&self, app_name: &str) -> Result<Vec<ClientInstance>> {
        self.inner.get_by_app_name(app_name).await
    }

    async fn delete_for_application(&self, app_name: &str) -> Result<()> {
        self.inner.delete_for_application(app_name).await
    }
}

#[derive(Default)]
pub struct RecordingLastSeenStore {
    pub inner: MemoryLastSeenStore,
    pub writes: Mutex<Vec<Vec<LastSeenInput>>>,
    pub cleans: AtomicUsize,
}

impl LastSeenStore for RecordingLastSeenStore {
    async fn set_last_seen(&self, entries: Vec<LastSeenInput>) -> Result<()> {
        self.writes.lock().push(entries.clone());
        self.inner.set_last_seen(entries).await
    }

    async fn clean_last_seen(&self) -> Result<()> {
        self.cleans.fetch_add(1, Ordering::SeqCst);
        self.inner.clean_last_seen().await
    }
}

#[derive(Default)]
pub struct RecordingEventStore {
    pub batches: Mutex<Vec<Vec<ApplicationCreatedEvent>>>,
}

impl EventStore for RecordingEventStore {
    async fn batch_store(&self, events: Vec<ApplicationCreatedEvent>) -> Result<()> {
        self.batches.lock().push(events);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingStores {
    pub metrics: Arc<RecordingMetricsStore>,
    pub applications: Arc<RecordingApplicationsStore>,
    pub instances: Arc<RecordingInstanceStore>,
    pub last_seen: Arc<RecordingLastSeenStore>,
    pub events: Arc<RecordingEventStore>,
}

impl RecordingStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made to the registration stores.
    pub fn registration_calls(&self) -> usize {
        self.applications.upserts.lock().len() + self.instances.upserts.lock().len()
    }
}

impl Stores for RecordingStores {
    type Metrics = RecordingMetricsStore;
    type Applications = RecordingApplicationsStore;
    type Instances = RecordingInstanceStore;
    type LastSeen = RecordingLastSeenStore;
    type Events = RecordingEventStore;

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

pub fn counts(yes: u64, no: u64) -> ToggleCounts {
    ToggleCounts {
        yes: Some(yes),
        no: Some(no),
        variants: None,
    }
}

pub fn report_at(
    app: &str,
    stop: DateTime<Utc>,
    toggles: impl IntoIterator<Item = (&'static str, ToggleCounts)>,
) -> UsageReport {
    UsageReport {
        app_name: app.to_string(),
        instance_id: Some("instance-1".to_string()),
        environment: Some("production".to_string()),
        sdk_version: Some("unleash-node-sdk:6.7.0".to_string()),
        bucket: MetricsBucket {
            start: stop - chrono::Duration::seconds(10),
            stop,
            toggles: toggles
                .into_iter()
                .map(|(name, c)| (name.to_string(), c))
                .collect::<HashMap<_, _>>(),
        },
    }
}

pub fn report(
    app: &str,
    toggles: impl IntoIterator<Item = (&'static str, ToggleCounts)>,
) -> UsageReport {
    report_at(app, Utc::now(), toggles)
}

pub fn registration(app: &str, instance: &str) -> ClientRegistration {
    ClientRegistration {
        app_name: app.to_string(),
        instance_id: Some(instance.to_string()),
        environment: Some("production".to_string()),
        sdk_version: Some("unleash-node-sdk:6.7.0".to_string()),
        client_ip: Some("10.0.0.1".to_string()),
        ..Default::default()
    }
}
