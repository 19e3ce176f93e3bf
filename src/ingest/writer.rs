use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::MutexGuard;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::model::{MetricsBucket, UsageReport};
use crate::store::MetricsStore;

/// Ids of rows this process wrote to the metrics store.
///
/// The writer holds the lock across `batch_insert` and recording the ids,
/// and the hydration poller holds it across fetch and filter, so a poll can
/// never observe one of our rows before its id is recorded.
#[derive(Debug, Default)]
pub struct OwnWrites {
    ids: tokio::sync::Mutex<HashSet<i64>>,
}

impl OwnWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.ids.lock().await
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

/// Rows are collapsed per application, environment and hour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollapseKey {
    pub app_name: String,
    pub environment: String,
    pub hour: DateTime<Utc>,
}

impl CollapseKey {
    pub fn for_report(report: &UsageReport) -> Self {
        Self {
            app_name: report.app_name.clone(),
            environment: report.environment().to_string(),
            hour: start_of_hour(report.bucket.stop),
        }
    }
}

fn start_of_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

/// Buffers accepted reports collapsed into hourly rows and writes every
/// buffered row in one store call per flush.
///
/// `enqueue` never waits. The buffer is bounded by distinct rows, not by
/// reports: a report for a row that is already buffered always fits, a
/// report that would open a row past the limit is dropped and counted.
pub struct ReportWriter<M> {
    store: Arc<M>,
    max_rows: usize,
    unsaved: Mutex<BTreeMap<CollapseKey, UsageReport>>,
    own_writes: Option<Arc<OwnWrites>>,
    health: Option<Arc<HealthMetrics>>,
    closed: AtomicBool,
}

impl<M: MetricsStore> ReportWriter<M> {
    /// Creates a writer holding at most `max_rows` unsaved rows. When
    /// `own_writes` is set, every inserted id is recorded in it.
    pub fn new(
        store: Arc<M>,
        max_rows: usize,
        own_writes: Option<Arc<OwnWrites>>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            max_rows: max_rows.max(1),
            unsaved: Mutex::new(BTreeMap::new()),
            own_writes,
            health,
            closed: AtomicBool::new(false),
        }
    }

    /// Folds `report` into its hourly row. Returns false if it was dropped.
    pub fn enqueue(&self, report: &UsageReport) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.dropped(report, "closed");
            return false;
        }

        let key = CollapseKey::for_report(report);
        let mut unsaved = self.unsaved.lock();
        if let Some(row) = unsaved.get_mut(&key) {
            collapse_into(row, report);
        } else if unsaved.len() >= self.max_rows {
            drop(unsaved);
            self.dropped(report, "full");
            return false;
        } else {
            unsaved.insert(key, collapsed_row(report));
        }
        let rows = unsaved.len();
        drop(unsaved);

        if let Some(health) = &self.health {
            health.write_buffer_rows.set(rows as f64);
        }
        true
    }

    fn dropped(&self, report: &UsageReport, reason: &'static str) {
        warn!(reason, app = %report.app_name, "metrics write buffer rejected report, dropping");
        if let Some(health) = &self.health {
            health.write_buffer_dropped.inc();
        }
    }

    /// Rows waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.unsaved.lock().len()
    }

    /// Writes every buffered row in one `batch_insert` call and returns how
    /// many rows were taken. An empty buffer makes no store call. Store
    /// failures are logged; the taken rows are dropped.
    pub async fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.unsaved.lock());
        if batch.is_empty() {
            return 0;
        }

        let started = Instant::now();
        let rows: Vec<UsageReport> = batch.into_values().collect();
        let count = rows.len();

        if let Some(health) = &self.health {
            health.write_buffer_rows.set(self.pending() as f64);
        }

        let result = match &self.own_writes {
            Some(own) => {
                let mut ids = own.lock().await;
                self.store
                    .batch_insert(rows)
                    .await
                    .map(|inserted| ids.extend(inserted))
            }
            None => self.store.batch_insert(rows).await.map(|_| ()),
        };

        match result {
            Ok(()) => {
                debug!(rows = count, "usage rows flushed");
                if let Some(health) = &self.health {
                    health.metrics_rows_flushed.inc_by(count as f64);
                }
            }
            Err(e) => {
                warn!(error = %e, rows = count, "persisting usage rows failed");
                if let Some(health) = &self.health {
                    health.record_store_error("metrics_batch_insert");
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .flush_duration
                .with_label_values(&["metrics"])
                .observe(started.elapsed().as_secs_f64());
        }

        count
    }

    /// Refuses further reports. Rows already buffered are kept for the
    /// final flush.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn collapsed_row(report: &UsageReport) -> UsageReport {
    UsageReport {
        app_name: report.app_name.clone(),
        instance_id: None,
        environment: Some(report.environment().to_string()),
        sdk_version: None,
        bucket: MetricsBucket {
            start: report.bucket.start,
            stop: report.bucket.stop,
            toggles: report.bucket.toggles.clone(),
        },
    }
}

fn collapse_into(row: &mut UsageReport, report: &UsageReport) {
    row.bucket.start = row.bucket.start.min(report.bucket.start);
    row.bucket.stop = row.bucket.stop.max(report.bucket.stop);
    for (feature, counts) in &report.bucket.toggles {
        row.bucket
            .toggles
            .entry(feature.clone())
            .or_default()
            .merge(counts);
    }
}
