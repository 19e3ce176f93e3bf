//! Usage-report ingestion.
//!
//! `ingest` validates a report, applies it to the minute and hour windows
//! and the per-application usage in memory, marks its features as seen and
//! folds it into the hourly row buffered for persistence. Nothing on this
//! path awaits I/O.

pub mod hydrate;
pub mod validate;
pub mod writer;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::error::{Error, Result};
use crate::export::health::HealthMetrics;
use crate::lastseen::LastSeenTracker;
use crate::model::{
    AppToggles, BucketCounts, ClientRegistration, FeatureUsage, UsageReport, YesNoCount,
};
use crate::registration::RegistrationDeduplicator;
use crate::store::Stores;
use crate::window::TimeWindow;

use self::hydrate::Hydrator;
use self::writer::{OwnWrites, ReportWriter};

/// Summary of an accepted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Features applied from the bucket.
    pub features: usize,
    /// Evaluations (yes + no) across those features.
    pub evaluations: u64,
}

/// Point-in-time copy of both windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSnapshot {
    pub last_hour: HashMap<String, YesNoCount>,
    pub last_minute: HashMap<String, YesNoCount>,
}

#[derive(Debug, Default)]
struct AppUsage {
    seen_toggles: BTreeSet<String>,
    count: u64,
}

/// Where a stored report came from when it is applied from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationSource {
    Replay,
    Poll,
}

impl HydrationSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Replay => "replay",
            Self::Poll => "poll",
        }
    }
}

/// Applies usage reports and client registrations to in-memory state.
pub struct MetricsIngestionOrchestrator<S: Stores> {
    minute: TimeWindow,
    hour: TimeWindow,
    global_count: AtomicU64,
    apps: DashMap<String, AppUsage>,
    registrations: Arc<RegistrationDeduplicator<S::Applications, S::Instances>>,
    last_seen: Arc<LastSeenTracker<S::LastSeen>>,
    writer: ReportWriter<S::Metrics>,
    hydrator: Hydrator<S::Metrics>,
    /// Writers of in-memory state hold the read guard for the whole
    /// mutation; shutdown takes the write guard to close.
    open: RwLock<bool>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Stores> MetricsIngestionOrchestrator<S> {
    /// Builds the orchestrator. `track_own_writes` must be set when the
    /// store is polled for new reports, so polling skips rows this process
    /// already applied.
    pub fn new(
        cfg: &MetricsConfig,
        stores: &S,
        registrations: Arc<RegistrationDeduplicator<S::Applications, S::Instances>>,
        last_seen: Arc<LastSeenTracker<S::LastSeen>>,
        track_own_writes: bool,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let minute = TimeWindow::new("minute", cfg.minute_window, cfg.sweep_interval);
        let hour = TimeWindow::new("hour", cfg.hour_window, cfg.sweep_interval);

        if let Some(health) = &health {
            for window in [&minute, &hour] {
                let evictions = health
                    .ledger_evictions
                    .with_label_values(&[window.ledger().name()]);
                window.on_expire(Box::new(move |_: &BucketCounts| evictions.inc()));
            }
        }

        let own_writes = track_own_writes.then(|| Arc::new(OwnWrites::new()));
        let metrics_store = stores.metrics();

        Self {
            minute,
            hour,
            global_count: AtomicU64::new(0),
            apps: DashMap::new(),
            registrations,
            last_seen,
            writer: ReportWriter::new(
                Arc::clone(&metrics_store),
                cfg.write_buffer_size,
                own_writes.clone(),
                health.clone(),
            ),
            hydrator: Hydrator::new(metrics_store, own_writes),
            open: RwLock::new(true),
            health,
        }
    }

    /// Validates and applies `report`, then buffers it for persistence.
    ///
    /// Features whose names are not URL friendly are dropped from the
    /// report; the rest is accepted.
    pub fn ingest(&self, mut report: UsageReport) -> Result<Accepted> {
        let open = self.open.read();
        if !*open {
            return Err(Error::closed("metrics ingestion"));
        }

        let validated = validate::validate_report(&report)
            .inspect_err(|e| self.record_validation_failure(e))?;

        if !validated.invalid_names.is_empty() {
            warn!(
                app = %report.app_name,
                features = ?validated.invalid_names,
                "dropping features with invalid names",
            );
            if let Some(health) = &self.health {
                health
                    .validation_failures
                    .with_label_values(&["featureName"])
                    .inc_by(validated.invalid_names.len() as f64);
            }
            report
                .bucket
                .toggles
                .retain(|name, _| validated.counts.contains_key(name));
        }

        let usages: Vec<FeatureUsage> = validated
            .counts
            .iter()
            .map(|(feature, count)| FeatureUsage {
                feature_name: feature.clone(),
                environment: report.environment().to_string(),
                yes: count.yes,
                no: count.no,
            })
            .collect();

        let accepted = self.apply(&report.app_name, validated.counts, report.bucket.stop);

        self.last_seen.update_last_seen(&usages);
        self.writer.enqueue(&report);
        drop(open);

        if let Some(health) = &self.health {
            health.reports_ingested.inc();
            health.evaluations.inc_by(accepted.evaluations as f64);
        }

        Ok(accepted)
    }

    /// Validates `registration` and buffers it for the next registration
    /// flush.
    pub fn register_client(&self, registration: ClientRegistration) -> Result<()> {
        let open = self.open.read();
        if !*open {
            return Err(Error::closed("client registration"));
        }

        validate::validate_registration(&registration)
            .inspect_err(|e| self.record_validation_failure(e))?;

        self.registrations.register(registration);
        Ok(())
    }

    /// Applies folded counts to both windows, the global count and the
    /// per-app usage. Callers hold the open read guard, so the windows
    /// cannot be destroyed between the two adds.
    fn apply(&self, app_name: &str, folded: BucketCounts, stop: DateTime<Utc>) -> Accepted {
        let features = folded.len();
        let evaluations = folded
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(c.total()));
        let names: Vec<String> = folded.keys().cloned().collect();

        for (window, counts) in [(&self.minute, folded.clone()), (&self.hour, folded)] {
            if let Err(e) = window.add(counts, stop) {
                debug!(error = %e, window = window.ledger().name(), "window add refused");
            }
        }

        let _ = self
            .global_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_add(evaluations))
            });

        let mut usage = self.apps.entry(app_name.to_string()).or_default();
        usage.count = usage.count.saturating_add(evaluations);
        usage.seen_toggles.extend(names);

        Accepted {
            features,
            evaluations,
        }
    }

    /// Applies a report read back from the metrics store. Invalid rows are
    /// logged and skipped.
    fn apply_stored(&self, report: &UsageReport, source: HydrationSource) -> bool {
        let open = self.open.read();
        if !*open {
            debug!(app = %report.app_name, "stored report not applied after shutdown");
            return false;
        }

        let validated = match validate::validate_report(report) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(error = %e, app = %report.app_name, "skipping invalid stored report");
                return false;
            }
        };

        self.apply(&report.app_name, validated.counts, report.bucket.stop);
        drop(open);

        if let Some(health) = &self.health {
            health
                .reports_hydrated
                .with_label_values(&[source.as_str()])
                .inc();
        }
        true
    }

    /// Replays the last hour of stored reports into the windows.
    pub async fn hydrate(&self) -> anyhow::Result<usize> {
        let reports = self.hydrator.replay().await?;
        Ok(reports
            .iter()
            .filter(|r| self.apply_stored(r, HydrationSource::Replay))
            .count())
    }

    /// Applies reports other processes wrote since the last poll.
    pub async fn poll_new_metrics(&self) -> anyhow::Result<usize> {
        let reports = self.hydrator.poll().await?;
        Ok(reports
            .iter()
            .filter(|r| self.apply_stored(r, HydrationSource::Poll))
            .count())
    }

    /// Current totals of both windows. Performs no I/O.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            last_hour: self.hour.snapshot(),
            last_minute: self.minute.snapshot(),
        }
    }

    /// Evaluations accepted since start-up, including hydrated reports.
    /// Saturates at `u64::MAX`.
    pub fn global_count(&self) -> u64 {
        self.global_count.load(Ordering::Relaxed)
    }

    /// Every application with the features it reported, sorted by name.
    pub fn apps_with_toggles(&self) -> Vec<AppToggles> {
        let mut apps: Vec<AppToggles> = self
            .apps
            .iter()
            .map(|entry| AppToggles {
                app_name: entry.key().clone(),
                seen_toggles: entry.seen_toggles.iter().cloned().collect(),
                metrics_count: entry.count,
            })
            .collect();
        apps.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        apps
    }

    /// Features reported by `app_name`, sorted. Empty for unknown apps.
    pub fn seen_toggles(&self, app_name: &str) -> Vec<String> {
        self.apps
            .get(app_name)
            .map(|usage| usage.seen_toggles.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// For each feature, the sorted names of the applications reporting it.
    pub fn seen_apps_per_toggle(&self) -> BTreeMap<String, Vec<String>> {
        let mut toggles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.apps.iter() {
            for toggle in &entry.seen_toggles {
                toggles
                    .entry(toggle.clone())
                    .or_default()
                    .push(entry.key().clone());
            }
        }
        for apps in toggles.values_mut() {
            apps.sort();
        }
        toggles
    }

    /// Runs one eviction pass on both windows and returns the number of
    /// buckets evicted.
    pub fn sweep(&self) -> usize {
        self.minute.sweep() + self.hour.sweep()
    }

    /// Hourly usage rows waiting for the next metrics flush.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending()
    }

    /// Writes the buffered hourly rows in one store call.
    pub async fn flush_metrics(&self) -> usize {
        self.writer.flush().await
    }

    /// Starts the window sweeps.
    pub fn start(&self) {
        self.minute.start();
        self.hour.start();
    }

    /// Refuses further input, stops the sweeps and flushes the buffered
    /// usage rows. Waits for in-flight ingests to finish applying first.
    /// Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut open = self.open.write();
            *open = false;
            self.minute.destroy();
            self.hour.destroy();
            self.writer.close();
        }
        self.writer.flush().await;
    }

    pub fn is_closed(&self) -> bool {
        !*self.open.read()
    }

    fn record_validation_failure(&self, e: &Error) {
        if let (Some(health), Error::Validation { field, .. }) = (&self.health, e) {
            health.validation_failures.with_label_values(&[*field]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{MetricsBucket, ToggleCounts};
    use crate::store::memory::MemoryStores;
    use crate::store::MetricsStore;

    fn orchestrator(stores: &MemoryStores) -> MetricsIngestionOrchestrator<MemoryStores> {
        let registrations = Arc::new(RegistrationDeduplicator::new(
            stores.applications(),
            stores.instances(),
            None,
        ));
        let last_seen = Arc::new(LastSeenTracker::new(stores.last_seen(), None));
        MetricsIngestionOrchestrator::new(
            &MetricsConfig::default(),
            stores,
            registrations,
            last_seen,
            false,
            None,
        )
    }

    fn report(app: &str, toggles: &[(&str, u64, u64)]) -> UsageReport {
        let now = Utc::now();
        UsageReport {
            app_name: app.to_string(),
            instance_id: Some("pod-1".to_string()),
            environment: Some("production".to_string()),
            sdk_version: None,
            bucket: MetricsBucket {
                start: now - chrono::Duration::seconds(10),
                stop: now,
                toggles: toggles
                    .iter()
                    .map(|(name, yes, no)| {
                        (
                            name.to_string(),
                            ToggleCounts {
                                yes: Some(*yes),
                                no: Some(*no),
                                variants: None,
                            },
                        )
                    })
                    .collect(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_updates_both_windows() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);

        let accepted = orch
            .ingest(report("checkout", &[("a", 3, 1), ("b", 0, 2)]))
            .expect("ingest");

        assert_eq!(
            accepted,
            Accepted {
                features: 2,
                evaluations: 6,
            }
        );
        let snapshot = orch.snapshot();
        assert_eq!(snapshot.last_minute["a"], YesNoCount::new(3, 1));
        assert_eq!(snapshot.last_hour["b"], YesNoCount::new(0, 2));
        assert_eq!(orch.global_count(), 6);
        assert_eq!(orch.pending_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_expires_before_hour() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);
        orch.ingest(report("checkout", &[("a", 5, 0)])).expect("ingest");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(orch.sweep(), 1);

        let snapshot = orch.snapshot();
        assert_eq!(snapshot.last_minute["a"], YesNoCount::ZERO);
        assert_eq!(snapshot.last_hour["a"], YesNoCount::new(5, 0));
    }

    #[tokio::test]
    async fn test_invalid_report_has_no_effect() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);

        let err = orch.ingest(report("", &[("a", 1, 0)])).expect_err("invalid");
        assert!(err.is_validation());
        assert!(orch.snapshot().last_hour.is_empty());
        assert_eq!(orch.global_count(), 0);
        assert_eq!(orch.pending_writes(), 0);
        assert!(orch.apps_with_toggles().is_empty());
    }

    #[tokio::test]
    async fn test_app_usage_tracking() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);
        orch.ingest(report("checkout", &[("a", 1, 0), ("b", 1, 1)]))
            .expect("ingest");
        orch.ingest(report("search", &[("a", 2, 0)])).expect("ingest");

        assert_eq!(orch.seen_toggles("checkout"), vec!["a", "b"]);
        assert!(orch.seen_toggles("unknown").is_empty());

        let apps = orch.apps_with_toggles();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].app_name, "checkout");
        assert_eq!(apps[0].metrics_count, 3);

        let per_toggle = orch.seen_apps_per_toggle();
        assert_eq!(per_toggle["a"], vec!["checkout", "search"]);
        assert_eq!(per_toggle["b"], vec!["checkout"]);
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);
        orch.start();
        orch.shutdown().await;
        orch.shutdown().await;

        assert!(orch.ingest(report("checkout", &[])).expect_err("closed").is_closed());
        let reg = ClientRegistration {
            app_name: "checkout".to_string(),
            ..Default::default()
        };
        assert!(orch.register_client(reg).expect_err("closed").is_closed());
    }

    #[tokio::test]
    async fn test_global_count_saturates() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);

        orch.ingest(report("checkout", &[("a", 1, 0)])).expect("ingest");
        orch.ingest(report("search", &[("a", u64::MAX, 0)])).expect("ingest");
        assert_eq!(orch.global_count(), u64::MAX);

        orch.ingest(report("search", &[("a", 5, 0)])).expect("ingest");
        assert_eq!(orch.global_count(), u64::MAX);
    }

    #[tokio::test]
    async fn test_invalid_feature_names_are_not_applied() {
        let stores = MemoryStores::new();
        let orch = orchestrator(&stores);

        let accepted = orch
            .ingest(report("checkout", &[("ok", 1, 0), ("not ok/♥", 3, 0)]))
            .expect("ingest");
        assert_eq!(accepted.features, 1);
        assert_eq!(accepted.evaluations, 1);
        assert!(!orch.snapshot().last_hour.contains_key("not ok/♥"));
        assert_eq!(orch.seen_toggles("checkout"), vec!["ok"]);

        orch.flush_metrics().await;
        let rows = stores.metrics.get_new_metrics(0).await.expect("query");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].report.bucket.toggles.contains_key("ok"));
        assert!(!rows[0].report.bucket.toggles.contains_key("not ok/♥"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_ingest_applies_reports_whole() {
        let stores = MemoryStores::new();
        let orch = Arc::new(orchestrator(&stores));
        orch.start();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let orch = Arc::clone(&orch);
                std::thread::spawn(move || {
                    let mut accepted = 0u64;
                    for _ in 0..500 {
                        if orch.ingest(report("checkout", &[("a", 1, 0)])).is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(1)).await;
        orch.shutdown().await;

        let accepted: u64 = workers
            .into_iter()
            .map(|w| w.join().expect("worker thread"))
            .sum();
        let snapshot = orch.snapshot();
        let minute = snapshot.last_minute.get("a").copied().unwrap_or_default();
        let hour = snapshot.last_hour.get("a").copied().unwrap_or_default();

        assert_eq!(minute, YesNoCount::new(accepted, 0));
        assert_eq!(hour, minute);
        assert_eq!(orch.global_count(), accepted);
    }

    #[tokio::test]
    async fn test_hydrate_replays_stored_reports() {
        let stores = MemoryStores::new();
        {
            let first = orchestrator(&stores);
            first.start();
            first.ingest(report("checkout", &[("a", 4, 4)])).expect("ingest");
            first.shutdown().await;
        }

        let second = orchestrator(&stores);
        assert_eq!(second.hydrate().await.expect("hydrate"), 1);
        assert_eq!(second.snapshot().last_hour["a"], YesNoCount::new(4, 4));
        assert_eq!(second.global_count(), 8);
    }
}
