//! Sliding-window aggregation: a time-ordered ledger of folded buckets and
//! the per-feature projection it keeps up to date.

pub mod ledger;
pub mod projection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{BucketCounts, YesNoCount};

pub use ledger::{ExpireFn, SlidingWindowLedger};
pub use projection::IncrementalProjection;

/// A ledger paired with the projection it feeds.
///
/// Adding a bucket updates the projection immediately; evicting it from the
/// ledger subtracts exactly the same counts.
pub struct TimeWindow {
    ledger: SlidingWindowLedger<BucketCounts>,
    projection: Arc<IncrementalProjection>,
}

impl TimeWindow {
    pub fn new(name: &'static str, window: Duration, sweep_interval: Duration) -> Self {
        let ledger = SlidingWindowLedger::new(name, window, sweep_interval);
        let projection = Arc::new(IncrementalProjection::new());

        let reverse = Arc::clone(&projection);
        ledger.on_expire(Box::new(move |bucket: &BucketCounts| {
            reverse.subtract_all(bucket);
        }));

        Self { ledger, projection }
    }

    /// Adds a folded bucket stamped with `stop`.
    pub fn add(&self, counts: BucketCounts, stop: DateTime<Utc>) -> Result<()> {
        if self.ledger.is_closed() {
            return Err(Error::closed(self.ledger.name()));
        }

        // Projection first: a stale bucket may be swept as soon as it lands.
        self.projection.add_all(&counts);
        if let Err(e) = self.ledger.add(counts.clone(), stop) {
            // Closed between the check and the add.
            self.projection.subtract_all(&counts);
            return Err(e);
        }
        Ok(())
    }

    /// Registers an additional eviction listener.
    pub fn on_expire(&self, f: ExpireFn<BucketCounts>) {
        self.ledger.on_expire(f);
    }

    pub fn snapshot(&self) -> HashMap<String, YesNoCount> {
        self.projection.snapshot()
    }

    pub fn get(&self, feature: &str) -> Option<YesNoCount> {
        self.projection.get(feature)
    }

    pub fn sweep(&self) -> usize {
        self.ledger.sweep()
    }

    pub fn ledger(&self) -> &SlidingWindowLedger<BucketCounts> {
        &self.ledger
    }

    pub fn start(&self) {
        self.ledger.start();
    }

    pub fn destroy(&self) {
        self.ledger.destroy();
    }
}

impl std::fmt::Debug for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeWindow")
            .field("ledger", &self.ledger)
            .field("features", &self.projection.len())
            .finish()
    }
}
