//! Service wiring and lifecycle.
//!
//! [`ClientMetricsService`] owns every pipeline component for one process,
//! runs their periodic jobs and flushes the buffers on shutdown.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::export::health::HealthMetrics;
use crate::ingest::{Accepted, MetricsIngestionOrchestrator, WindowSnapshot};
use crate::lastseen::LastSeenTracker;
use crate::model::{AppToggles, ClientInstance, ClientRegistration, UsageReport};
use crate::registration::{ApplicationAnnouncer, FlushOutcome, RegistrationDeduplicator};
use crate::sdk;
use crate::store::{InstanceStore, LastSeenStore, MetricsStore, Stores};

/// What is known about one application.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationDetails {
    pub app_name: String,
    pub seen_toggles: Vec<String>,
    pub instances: Vec<ClientInstance>,
}

/// Result of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub metrics_deleted: u64,
}

/// Client metrics pipeline for one process.
pub struct ClientMetricsService<S: Stores> {
    cfg: Config,
    stores: S,
    orchestrator: Arc<MetricsIngestionOrchestrator<S>>,
    registrations: Arc<RegistrationDeduplicator<S::Applications, S::Instances>>,
    last_seen: Arc<LastSeenTracker<S::LastSeen>>,
    announcer: Arc<ApplicationAnnouncer<S::Applications, S::Events>>,
    health: Option<Arc<HealthMetrics>>,
    running: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Stores> std::fmt::Debug for ClientMetricsService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetricsService")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: Stores> ClientMetricsService<S> {
    /// Builds every component. Nothing runs until [`start`](Self::start).
    pub fn new(cfg: Config, stores: S, health: Option<Arc<HealthMetrics>>) -> Self {
        let registrations = Arc::new(RegistrationDeduplicator::new(
            stores.applications(),
            stores.instances(),
            health.clone(),
        ));
        let last_seen = Arc::new(LastSeenTracker::new(stores.last_seen(), health.clone()));
        let announcer = Arc::new(ApplicationAnnouncer::new(
            stores.applications(),
            stores.events(),
            health.clone(),
        ));
        let orchestrator = Arc::new(MetricsIngestionOrchestrator::new(
            &cfg.metrics,
            &stores,
            Arc::clone(&registrations),
            Arc::clone(&last_seen),
            cfg.hydration.poll_interval.is_some(),
            health.clone(),
        ));

        Self {
            cfg,
            stores,
            orchestrator,
            registrations,
            last_seen,
            announcer,
            health,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replays stored metrics (when enabled) and starts the periodic jobs.
    /// A second call is a no-op.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("client metrics service is shut down");
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.cfg.hydration.enabled {
            match self.orchestrator.hydrate().await {
                Ok(applied) => info!(reports = applied, "hydrated windows from metrics store"),
                // Start with empty windows rather than not at all.
                Err(e) => warn!(error = %e, "hydrating windows failed"),
            }
        }

        self.orchestrator.start();

        let registrations = Arc::clone(&self.registrations);
        self.spawn_periodic("registration flush", self.cfg.registration.flush_interval, move || {
            let registrations = Arc::clone(&registrations);
            async move {
                registrations.flush().await;
            }
        });

        let announcer = Arc::clone(&self.announcer);
        self.spawn_periodic("announcement", self.cfg.announcement.interval, move || {
            let announcer = Arc::clone(&announcer);
            async move {
                announcer.run_once().await;
            }
        });

        let orchestrator = Arc::clone(&self.orchestrator);
        self.spawn_periodic("metrics flush", self.cfg.metrics.flush_interval, move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move {
                orchestrator.flush_metrics().await;
            }
        });

        let last_seen = Arc::clone(&self.last_seen);
        self.spawn_periodic("last seen flush", self.cfg.last_seen.flush_interval, move || {
            let last_seen = Arc::clone(&last_seen);
            async move {
                last_seen.store().await;
            }
        });

        if let Some(poll_interval) = self.cfg.hydration.poll_interval {
            let orchestrator = Arc::clone(&self.orchestrator);
            self.spawn_periodic("metrics poll", poll_interval, move || {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    match orchestrator.poll_new_metrics().await {
                        Ok(0) => {}
                        Ok(applied) => debug!(reports = applied, "applied new stored metrics"),
                        Err(e) => warn!(error = %e, "polling new metrics failed"),
                    }
                }
            });
        }

        let metrics = self.stores.metrics();
        let last_seen = Arc::clone(&self.last_seen);
        let health = self.health.clone();
        let max_age = self.cfg.retention.metrics_max_age;
        self.spawn_periodic("retention", self.cfg.retention.interval, move || {
            let metrics = Arc::clone(&metrics);
            let last_seen = Arc::clone(&last_seen);
            let health = health.clone();
            async move {
                if let Err(e) = retention_pass(&*metrics, &*last_seen, max_age, health.as_deref()).await
                {
                    warn!(error = %e, "retention pass failed");
                }
            }
        });

        info!(
            minute_window = ?self.cfg.metrics.minute_window,
            hour_window = ?self.cfg.metrics.hour_window,
            metrics_flush = ?self.cfg.metrics.flush_interval,
            registration_flush = ?self.cfg.registration.flush_interval,
            polling = self.cfg.hydration.poll_interval.is_some(),
            "client metrics service started",
        );

        Ok(())
    }

    /// Runs `job` every `period`, first after one full period, until the
    /// service shuts down.
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(job = name, "periodic job stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        job().await;
                    }
                }
            }
        });

        self.tasks.lock().push(handle);
    }

    /// Stops every job, then flushes the usage-row, registration and
    /// last-seen buffers once more. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "periodic job failed");
            }
        }

        self.orchestrator.shutdown().await;

        let registrations = self.registrations.flush().await;
        let last_seen = self.last_seen.store().await;
        self.running.store(false, Ordering::SeqCst);

        info!(
            instances = registrations.instances,
            last_seen,
            "client metrics service stopped",
        );
    }

    /// See [`MetricsIngestionOrchestrator::ingest`].
    pub fn ingest(&self, report: UsageReport) -> Result<Accepted> {
        self.orchestrator.ingest(report)
    }

    /// See [`MetricsIngestionOrchestrator::register_client`].
    pub fn register_client(&self, registration: ClientRegistration) -> Result<()> {
        self.orchestrator.register_client(registration)
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.orchestrator.snapshot()
    }

    pub fn global_count(&self) -> u64 {
        self.orchestrator.global_count()
    }

    pub fn apps_with_toggles(&self) -> Vec<AppToggles> {
        self.orchestrator.apps_with_toggles()
    }

    pub fn seen_toggles(&self, app_name: &str) -> Vec<String> {
        self.orchestrator.seen_toggles(app_name)
    }

    pub fn seen_apps_per_toggle(&self) -> BTreeMap<String, Vec<String>> {
        self.orchestrator.seen_apps_per_toggle()
    }

    /// Outdated entries of `sdk_versions`, deduplicated in first-seen order.
    pub fn find_outdated_sdks<V: AsRef<str>>(&self, sdk_versions: &[V]) -> Vec<String> {
        sdk::find_outdated_sdks(sdk_versions)
    }

    /// Seen features and registered instances of `app_name`.
    pub async fn application_details(&self, app_name: &str) -> anyhow::Result<ApplicationDetails> {
        let instances = self
            .stores
            .instances()
            .get_by_app_name(app_name)
            .await
            .with_context(|| format!("loading instances of {app_name}"))?;

        Ok(ApplicationDetails {
            app_name: app_name.to_string(),
            seen_toggles: self.seen_toggles(app_name),
            instances,
        })
    }

    /// Removes every registered instance of `app_name`.
    pub async fn delete_application_instances(&self, app_name: &str) -> anyhow::Result<()> {
        self.stores
            .instances()
            .delete_for_application(app_name)
            .await
            .with_context(|| format!("deleting instances of {app_name}"))
    }

    /// Writes the buffered hourly usage rows now.
    pub async fn flush_metrics(&self) -> usize {
        self.orchestrator.flush_metrics().await
    }

    /// Runs a registration flush now.
    pub async fn flush_registrations(&self) -> FlushOutcome {
        self.registrations.flush().await
    }

    /// Runs a last-seen flush now.
    pub async fn flush_last_seen(&self) -> usize {
        self.last_seen.store().await
    }

    /// Runs an announcement pass now.
    pub async fn announce(&self) -> anyhow::Result<usize> {
        self.announcer.announce().await
    }

    /// Runs a retention pass now.
    pub async fn run_retention(&self) -> anyhow::Result<RetentionOutcome> {
        retention_pass(
            &*self.stores.metrics(),
            &*self.last_seen,
            self.cfg.retention.metrics_max_age,
            self.health.as_deref(),
        )
        .await
    }

    pub fn orchestrator(&self) -> &MetricsIngestionOrchestrator<S> {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

/// Deletes stored reports past `max_age`, then prunes last-seen entries of
/// removed features.
async fn retention_pass<M, L>(
    metrics: &M,
    last_seen: &LastSeenTracker<L>,
    max_age: Duration,
    health: Option<&HealthMetrics>,
) -> anyhow::Result<RetentionOutcome>
where
    M: MetricsStore,
    L: LastSeenStore,
{
    let metrics_deleted = metrics
        .delete_older_than(max_age)
        .await
        .inspect_err(|_| record_store_error(health, "metrics_delete_older_than"))
        .context("deleting old metrics")?;

    last_seen
        .clean_last_seen()
        .await
        .inspect_err(|_| record_store_error(health, "clean_last_seen"))
        .context("cleaning last seen")?;

    debug!(metrics_deleted, ?max_age, "retention pass finished");

    Ok(RetentionOutcome { metrics_deleted })
}

fn record_store_error(health: Option<&HealthMetrics>, operation: &str) {
    if let Some(health) = health {
        health.record_store_error(operation);
    }
}
