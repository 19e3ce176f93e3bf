use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::YesNoCount;

/// Exact running sums. Wider than the reported counts so that adding and
/// later subtracting the same amounts always returns to the prior value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    yes: u128,
    no: u128,
}

impl Totals {
    fn add(&mut self, count: YesNoCount) {
        self.yes = self.yes.saturating_add(u128::from(count.yes));
        self.no = self.no.saturating_add(u128::from(count.no));
    }

    fn subtract(&mut self, count: YesNoCount) {
        self.yes = self.yes.saturating_sub(u128::from(count.yes));
        self.no = self.no.saturating_sub(u128::from(count.no));
    }

    /// Reported view; sums beyond `u64::MAX` read as `u64::MAX`.
    fn to_count(self) -> YesNoCount {
        YesNoCount {
            yes: u64::try_from(self.yes).unwrap_or(u64::MAX),
            no: u64::try_from(self.no).unwrap_or(u64::MAX),
        }
    }
}

/// Running per-feature totals kept in step with a ledger.
///
/// Every `add` made when an entry enters a window is matched by a
/// `subtract` when that entry is evicted, so reads never need to scan the
/// ledger. Keys are created on first touch and never removed.
#[derive(Debug, Default)]
pub struct IncrementalProjection {
    totals: RwLock<HashMap<String, Totals>>,
}

impl IncrementalProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, count: YesNoCount) {
        let mut totals = self.totals.write();
        match totals.get_mut(key) {
            Some(existing) => existing.add(count),
            None => {
                let mut fresh = Totals::default();
                fresh.add(count);
                totals.insert(key.to_string(), fresh);
            }
        }
    }

    /// Removes `count` from `key`, clamping each side at zero. An unknown key
    /// is created as `{0, 0}`.
    pub fn subtract(&self, key: &str, count: YesNoCount) {
        self.totals
            .write()
            .entry(key.to_string())
            .or_default()
            .subtract(count);
    }

    /// Applies every feature of a folded bucket.
    pub fn add_all<'a>(&self, entries: impl IntoIterator<Item = (&'a String, &'a YesNoCount)>) {
        let mut totals = self.totals.write();
        for (key, count) in entries {
            totals.entry(key.clone()).or_default().add(*count);
        }
    }

    /// Reverses [`add_all`](Self::add_all).
    pub fn subtract_all<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a String, &'a YesNoCount)>,
    ) {
        let mut totals = self.totals.write();
        for (key, count) in entries {
            totals.entry(key.clone()).or_default().subtract(*count);
        }
    }

    pub fn get(&self, key: &str) -> Option<YesNoCount> {
        self.totals.read().get(key).map(|t| t.to_count())
    }

    /// Copy of the current totals.
    pub fn snapshot(&self) -> HashMap<String, YesNoCount> {
        self.totals
            .read()
            .iter()
            .map(|(key, t)| (key.clone(), t.to_count()))
            .collect()
    }

    /// Number of distinct keys ever touched.
    pub fn len(&self) -> usize {
        self.totals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
