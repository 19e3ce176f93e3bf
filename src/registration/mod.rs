//! Client registration deduplication.
//!
//! SDK instances re-register on every heartbeat. Registrations are merged in
//! memory per (app, instance) and written in one batch per flush interval,
//! so store load is bounded by distinct clients rather than heartbeats.

pub mod announce;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::model::{Application, ClientIdentity, ClientInstance, ClientRegistration};
use crate::sdk;
use crate::store::{ApplicationsStore, InstanceStore};

pub use announce::ApplicationAnnouncer;

/// Result of one registration flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Distinct applications in the batch.
    pub applications: usize,
    /// Distinct client instances in the batch.
    pub instances: usize,
    /// False when a store call failed and the batch was dropped.
    pub persisted: bool,
}

#[derive(Default)]
struct SeenClients {
    next_seq: u64,
    // Sequence of the latest registration for ordering "last write wins".
    clients: HashMap<ClientIdentity, (u64, ClientRegistration)>,
}

/// Buffers registrations and writes distinct applications and instances.
pub struct RegistrationDeduplicator<A, I> {
    applications: Arc<A>,
    instances: Arc<I>,
    seen: Mutex<SeenClients>,
    health: Option<Arc<HealthMetrics>>,
}

impl<A: ApplicationsStore, I: InstanceStore> RegistrationDeduplicator<A, I> {
    pub fn new(applications: Arc<A>, instances: Arc<I>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            applications,
            instances,
            seen: Mutex::new(SeenClients::default()),
            health,
        }
    }

    /// Merges `registration` into the buffer. Never performs I/O.
    pub fn register(&self, registration: ClientRegistration) {
        if let Some(version) = registration.sdk_version.as_deref() {
            if sdk::is_outdated_sdk(version) {
                debug!(
                    app = %registration.app_name,
                    sdk_version = version,
                    "registration from outdated sdk",
                );
                if let Some(health) = &self.health {
                    health.outdated_sdk_registrations.inc();
                }
            }
        }

        let identity = registration.identity();
        let mut seen = self.seen.lock();
        let seq = seen.next_seq;
        seen.next_seq += 1;

        match seen.clients.get_mut(&identity) {
            Some((latest, existing)) => {
                *latest = seq;
                existing.merge(registration);
            }
            None => {
                seen.clients.insert(identity, (seq, registration));
            }
        }
    }

    /// Number of distinct clients waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.seen.lock().clients.len()
    }

    /// Writes the buffered registrations: applications first, then
    /// instances. An empty buffer makes no store calls.
    pub async fn flush(&self) -> FlushOutcome {
        let batch = std::mem::take(&mut self.seen.lock().clients);
        if batch.is_empty() {
            return FlushOutcome::default();
        }

        let started = Instant::now();
        let mut registrations: Vec<(u64, ClientRegistration)> = batch.into_values().collect();
        registrations.sort_unstable_by_key(|(seq, _)| *seq);

        let now = Utc::now();
        let instances: Vec<ClientInstance> = registrations
            .iter()
            .map(|(_, reg)| ClientInstance::from_registration(reg, now))
            .collect();
        let applications = unique_applications(registrations.iter().map(|(_, reg)| reg));

        let mut outcome = FlushOutcome {
            applications: applications.len(),
            instances: instances.len(),
            persisted: false,
        };

        match self.persist(applications, instances).await {
            Ok(()) => {
                outcome.persisted = true;
                debug!(
                    applications = outcome.applications,
                    instances = outcome.instances,
                    "registrations flushed",
                );
                if let Some(health) = &self.health {
                    health.applications_flushed.inc_by(outcome.applications as f64);
                    health.instances_flushed.inc_by(outcome.instances as f64);
                }
            }
            Err((operation, e)) => {
                warn!(
                    error = %e,
                    operation,
                    applications = outcome.applications,
                    instances = outcome.instances,
                    "flushing registrations failed",
                );
                if let Some(health) = &self.health {
                    health.record_store_error(operation);
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .flush_duration
                .with_label_values(&["registration"])
                .observe(started.elapsed().as_secs_f64());
        }

        outcome
    }

    async fn persist(
        &self,
        applications: Vec<Application>,
        instances: Vec<ClientInstance>,
    ) -> Result<(), (&'static str, anyhow::Error)> {
        self.applications
            .bulk_upsert(applications)
            .await
            .map_err(|e| ("applications_bulk_upsert", e))?;
        self.instances
            .bulk_upsert(instances)
            .await
            .map_err(|e| ("instances_bulk_upsert", e))
    }
}

/// One application per app name; the latest registration wins.
fn unique_applications<'a>(
    registrations: impl Iterator<Item = &'a ClientRegistration>,
) -> Vec<Application> {
    let mut order: Vec<String> = Vec::new();
    let mut by_name: HashMap<String, Application> = HashMap::new();

    for reg in registrations {
        if !by_name.contains_key(&reg.app_name) {
            order.push(reg.app_name.clone());
        }
        by_name.insert(reg.app_name.clone(), Application::from(reg));
    }

    order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryApplicationsStore, MemoryInstanceStore};

    fn registration(app: &str, instance: &str) -> ClientRegistration {
        ClientRegistration {
            app_name: app.to_string(),
            instance_id: Some(instance.to_string()),
            environment: Some("production".to_string()),
            sdk_version: Some("unleash-node-sdk:6.7.0".to_string()),
            ..Default::default()
        }
    }

    fn dedup() -> (
        RegistrationDeduplicator<MemoryApplicationsStore, MemoryInstanceStore>,
        Arc<MemoryApplicationsStore>,
        Arc<MemoryInstanceStore>,
    ) {
        let apps = Arc::new(MemoryApplicationsStore::new());
        let instances = Arc::new(MemoryInstanceStore::new());
        let dedup = RegistrationDeduplicator::new(Arc::clone(&apps), Arc::clone(&instances), None);
        (dedup, apps, instances)
    }

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let (dedup, apps, instances) = dedup();
        for _ in 0..5 {
            dedup.register(registration("checkout", "pod-1"));
        }
        dedup.register(registration("checkout", "pod-2"));

        let outcome = dedup.flush().await;

        assert_eq!(
            outcome,
            FlushOutcome {
                applications: 1,
                instances: 2,
                persisted: true,
            }
        );
        assert_eq!(apps.len(), 1);
        assert_eq!(instances.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (dedup, apps, instances) = dedup();
        assert_eq!(dedup.flush().await, FlushOutcome::default());
        assert!(apps.is_empty());
        assert!(instances.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_after_flush_is_written_again() {
        let (dedup, _, instances) = dedup();
        dedup.register(registration("checkout", "pod-1"));
        assert_eq!(dedup.flush().await.instances, 1);

        dedup.register(registration("checkout", "pod-1"));
        assert_eq!(dedup.pending(), 1);
        assert_eq!(dedup.flush().await.instances, 1);
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn test_latest_registration_wins_per_app() {
        let mut first = registration("checkout", "pod-1");
        first.sdk_version = Some("unleash-node-sdk:6.5.0".to_string());
        let second = registration("checkout", "pod-2");

        let apps = unique_applications([&first, &second].into_iter());

        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].sdk_version.as_deref(), Some("unleash-node-sdk:6.7.0"));
    }

    #[test]
    fn test_merge_keeps_fields_within_window() {
        let (dedup, _, _) = dedup();
        let mut first = registration("checkout", "pod-1");
        first.strategies = Some(vec!["default".to_string()]);
        let mut second = registration("checkout", "pod-1");
        second.sdk_version = None;

        dedup.register(first);
        dedup.register(second);

        let seen = dedup.seen.lock();
        let (_, merged) = seen
            .clients
            .values()
            .next()
            .expect("one buffered client");
        assert_eq!(merged.strategies, Some(vec!["default".to_string()]));
        assert_eq!(merged.sdk_version.as_deref(), Some("unleash-node-sdk:6.7.0"));
    }
}
