//! Persistence collaborators consumed by the pipeline.
//!
//! Traits use `impl Future + Send` return types rather than trait objects so
//! implementations can be plain `async fn` and the pipeline stays generic
//! with static dispatch.

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::model::{
    Application, ApplicationCreatedEvent, ClientInstance, LastSeenInput, StoredReport, UsageReport,
};

/// Durable store for hourly-collapsed usage rows.
pub trait MetricsStore: Send + Sync + 'static {
    /// Persists a batch of rows in one call and returns their ids in input
    /// order. Ids increase monotonically.
    fn batch_insert(
        &self,
        reports: Vec<UsageReport>,
    ) -> impl Future<Output = Result<Vec<i64>>> + Send;

    /// Reports whose bucket stopped within the last hour, ordered by id.
    fn get_metrics_last_hour(&self) -> impl Future<Output = Result<Vec<StoredReport>>> + Send;

    /// Reports with an id greater than `after_id`, ordered by id.
    fn get_new_metrics(
        &self,
        after_id: i64,
    ) -> impl Future<Output = Result<Vec<StoredReport>>> + Send;

    /// Deletes reports older than `max_age` and returns how many were removed.
    fn delete_older_than(&self, max_age: Duration) -> impl Future<Output = Result<u64>> + Send;
}

/// Store for application rows.
pub trait ApplicationsStore: Send + Sync + 'static {
    fn bulk_upsert(&self, apps: Vec<Application>) -> impl Future<Output = Result<()>> + Send;

    fn get_unannounced(&self) -> impl Future<Output = Result<Vec<Application>>> + Send;

    /// Atomically flips every unannounced application to announced and
    /// returns the applications that were flipped.
    fn set_unannounced_to_announced(
        &self,
    ) -> impl Future<Output = Result<Vec<Application>>> + Send;
}

/// Store for per-instance registration rows.
pub trait InstanceStore: Send + Sync + 'static {
    fn bulk_upsert(&self, instances: Vec<ClientInstance>)
        -> impl Future<Output = Result<()>> + Send;

    fn get_by_app_name(
        &self,
        app_name: &str,
    ) -> impl Future<Output = Result<Vec<ClientInstance>>> + Send;

    fn delete_for_application(&self, app_name: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Store for per-(feature, environment) last-seen timestamps.
pub trait LastSeenStore: Send + Sync + 'static {
    fn set_last_seen(&self, entries: Vec<LastSeenInput>)
        -> impl Future<Output = Result<()>> + Send;

    /// Removes entries that no longer refer to a known feature.
    fn clean_last_seen(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Domain event sink.
pub trait EventStore: Send + Sync + 'static {
    fn batch_store(
        &self,
        events: Vec<ApplicationCreatedEvent>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Bundle of every store the service needs.
pub trait Stores: Send + Sync + 'static {
    type Metrics: MetricsStore;
    type Applications: ApplicationsStore;
    type Instances: InstanceStore;
    type LastSeen: LastSeenStore;
    type Events: EventStore;

    fn metrics(&self) -> Arc<Self::Metrics>;
    fn applications(&self) -> Arc<Self::Applications>;
    fn instances(&self) -> Arc<Self::Instances>;
    fn last_seen(&self) -> Arc<Self::LastSeen>;
    fn events(&self) -> Arc<Self::Events>;
}
