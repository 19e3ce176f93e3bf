use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::model::ApplicationCreatedEvent;
use crate::store::{ApplicationsStore, EventStore};

/// Emits one application-created event per newly seen application.
pub struct ApplicationAnnouncer<A, E> {
    applications: Arc<A>,
    events: Arc<E>,
    health: Option<Arc<HealthMetrics>>,
}

impl<A: ApplicationsStore, E: EventStore> ApplicationAnnouncer<A, E> {
    pub fn new(applications: Arc<A>, events: Arc<E>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            applications,
            events,
            health,
        }
    }

    /// Promotes every unannounced application and stores their events in a
    /// single batch. Returns the number of applications announced.
    pub async fn announce(&self) -> anyhow::Result<usize> {
        let started = Instant::now();
        let result = self.announce_inner().await;

        if let Some(health) = &self.health {
            health
                .flush_duration
                .with_label_values(&["announce"])
                .observe(started.elapsed().as_secs_f64());
        }

        result
    }

    async fn announce_inner(&self) -> anyhow::Result<usize> {
        let apps = self
            .applications
            .set_unannounced_to_announced()
            .await
            .inspect_err(|_| self.record_error("set_unannounced_to_announced"))?;

        if apps.is_empty() {
            return Ok(0);
        }

        let count = apps.len();
        let events: Vec<ApplicationCreatedEvent> = apps
            .into_iter()
            .map(ApplicationCreatedEvent::for_application)
            .collect();

        self.events
            .batch_store(events)
            .await
            .inspect_err(|_| self.record_error("events_batch_store"))?;

        debug!(applications = count, "applications announced");
        if let Some(health) = &self.health {
            health.applications_announced.inc_by(count as f64);
        }

        Ok(count)
    }

    /// Timer entry point: failures are logged and swallowed.
    pub async fn run_once(&self) {
        if let Err(e) = self.announce().await {
            warn!(error = %e, "announcing applications failed");
        }
    }

    fn record_error(&self, operation: &str) {
        if let Some(health) = &self.health {
            health.record_store_error(operation);
        }
    }
}
