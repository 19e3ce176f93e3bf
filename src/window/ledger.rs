use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Callback invoked with the payload of every evicted entry.
pub type ExpireFn<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Time-ordered list of entries that expire once they are older than the
/// window.
///
/// Entries are keyed by the instant at which they become evictable plus an
/// insertion sequence, so late arrivals with old timestamps are still
/// evicted oldest-first. Every evicted entry is handed to each registered
/// expire callback exactly once.
pub struct SlidingWindowLedger<T> {
    name: &'static str,
    sweep_interval: Duration,
    inner: Arc<Inner<T>>,
    running: AtomicBool,
    cancel: CancellationToken,
}

struct Inner<T> {
    window: Duration,
    entries: Mutex<Entries<T>>,
    listeners: Mutex<Vec<ExpireFn<T>>>,
    closed: AtomicBool,
}

struct Entries<T> {
    next_seq: u64,
    by_deadline: BTreeMap<(Instant, u64), T>,
}

impl<T> std::fmt::Debug for SlidingWindowLedger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLedger")
            .field("name", &self.name)
            .field("window", &self.inner.window)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl<T: Send + Sync + 'static> SlidingWindowLedger<T> {
    /// Creates a ledger that keeps entries for `window`. The background sweep
    /// runs every `sweep_interval` once [`start`](Self::start) is called.
    pub fn new(name: &'static str, window: Duration, sweep_interval: Duration) -> Self {
        Self {
            name,
            sweep_interval,
            inner: Arc::new(Inner {
                window,
                entries: Mutex::new(Entries {
                    next_seq: 0,
                    by_deadline: BTreeMap::new(),
                }),
                listeners: Mutex::new(Vec::with_capacity(2)),
                closed: AtomicBool::new(false),
            }),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Appends an entry stamped with the wall-clock time `timestamp`.
    ///
    /// The timestamp is aged against the current wall clock, so an entry
    /// stamped further back than the window is accepted and goes out on the
    /// next sweep.
    pub fn add(&self, payload: T, timestamp: DateTime<Utc>) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::closed(self.name));
        }

        let now = Instant::now();
        let deadline = deadline_for(now, self.inner.window, Utc::now(), timestamp);

        let mut entries = self.inner.entries.lock();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.by_deadline.insert((deadline, seq), payload);

        Ok(())
    }

    /// Registers a callback that receives every evicted payload.
    pub fn on_expire(&self, f: ExpireFn<T>) {
        self.inner.listeners.lock().push(f);
    }

    /// Evicts every entry whose age has reached the window and returns how
    /// many were evicted.
    pub fn sweep(&self) -> usize {
        self.inner.sweep(self.name)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the periodic sweep task. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let name = self.name;
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let sweep_interval = self.sweep_interval;

        debug!(
            ledger = name,
            window = ?inner.window,
            ?sweep_interval,
            "ledger sweep started",
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(ledger = name, "ledger sweep stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        inner.sweep(name);
                    }
                }
            }
        });
    }

    /// Stops the sweep task and closes the ledger for new entries. Idempotent.
    pub fn destroy(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for SlidingWindowLedger<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> Inner<T> {
    fn sweep(&self, name: &'static str) -> usize {
        let now = Instant::now();

        let expired = {
            let mut entries = self.entries.lock();
            // Deadlines strictly after `now` survive in the split-off tail.
            let live = entries.by_deadline.split_off(&(now, u64::MAX));
            std::mem::replace(&mut entries.by_deadline, live)
        };

        if expired.is_empty() {
            return 0;
        }

        let listeners = self.listeners.lock();
        for payload in expired.values() {
            for listener in listeners.iter() {
                listener(payload);
            }
        }

        trace!(ledger = name, evicted = expired.len(), "ledger swept");

        expired.len()
    }
}

/// Instant at which an entry stamped `timestamp` reaches `window` of age.
fn deadline_for(
    now: Instant,
    window: Duration,
    wall_now: DateTime<Utc>,
    timestamp: DateTime<Utc>,
) -> Instant {
    match (wall_now - timestamp).to_std() {
        // Past timestamp: the entry has already aged this much.
        Ok(age) => now + window.saturating_sub(age),
        // Future timestamp: it lives for the window plus the skew.
        Err(_) => (timestamp - wall_now)
            .to_std()
            .ok()
            .and_then(|skew| now.checked_add(window + skew))
            .unwrap_or(now + window),
    }
}
