use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use super::writer::OwnWrites;
use crate::model::{StoredReport, UsageReport};
use crate::store::MetricsStore;

/// Pulls stored reports into memory: the last hour once at start-up, then
/// anything newer than a monotonic id cursor.
pub struct Hydrator<M> {
    store: Arc<M>,
    own_writes: Option<Arc<OwnWrites>>,
    cursor: AtomicI64,
}

impl<M: MetricsStore> Hydrator<M> {
    /// `own_writes` lists ids written by this process; those rows are
    /// skipped when polling because ingest already applied them.
    pub fn new(store: Arc<M>, own_writes: Option<Arc<OwnWrites>>) -> Self {
        Self {
            store,
            own_writes,
            cursor: AtomicI64::new(0),
        }
    }

    /// Highest report id applied so far.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Loads every report of the last hour and moves the cursor past them.
    pub async fn replay(&self) -> Result<Vec<UsageReport>> {
        let stored = self
            .store
            .get_metrics_last_hour()
            .await
            .context("loading last hour of metrics")?;

        let max_id = stored.iter().map(|r| r.id).max();
        if let Some(max_id) = max_id {
            self.cursor.fetch_max(max_id, Ordering::AcqRel);
        }

        debug!(reports = stored.len(), cursor = self.cursor(), "metrics replayed");

        Ok(stored.into_iter().map(|r| r.report).collect())
    }

    /// Fetches reports newer than the cursor that this process did not
    /// write itself. On error the cursor is left unchanged.
    pub async fn poll(&self) -> Result<Vec<UsageReport>> {
        let after = self.cursor();

        let mut own = match &self.own_writes {
            Some(own) => Some(own.lock().await),
            None => None,
        };

        let stored: Vec<StoredReport> = self
            .store
            .get_new_metrics(after)
            .await
            .with_context(|| format!("fetching metrics after id {after}"))?;

        let mut max_id = after;
        let mut foreign = Vec::with_capacity(stored.len());
        for StoredReport { id, report } in stored {
            max_id = max_id.max(id);
            let is_own = own.as_mut().is_some_and(|ids| ids.remove(&id));
            if !is_own {
                foreign.push(report);
            }
        }

        // Ids at or below the cursor are never returned again.
        if let Some(ids) = own.as_mut() {
            ids.retain(|id| *id > max_id);
        }

        self.cursor.fetch_max(max_id, Ordering::AcqRel);

        Ok(foreign)
    }
}
