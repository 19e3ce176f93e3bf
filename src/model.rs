//! Wire and domain types shared by the pipeline components.
//!
//! Report and registration types deserialize from the camelCase JSON that
//! SDKs send; everything else is internal and only serialized for stores.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Environment used when a report or registration does not name one.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Instance id used when an SDK does not send one.
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// Variant key that counts towards `no` when folding variants.
pub const DISABLED_VARIANT: &str = "disabled";

/// One usage report sent by an SDK instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub app_name: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub sdk_version: Option<String>,
    pub bucket: MetricsBucket,
}

impl UsageReport {
    /// Environment of the report, falling back to [`DEFAULT_ENVIRONMENT`].
    pub fn environment(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    /// Instance id of the report, falling back to [`DEFAULT_INSTANCE_ID`].
    pub fn instance_id(&self) -> &str {
        self.instance_id.as_deref().unwrap_or(DEFAULT_INSTANCE_ID)
    }
}

/// One SDK-reported interval of per-feature evaluation counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(default)]
    pub toggles: HashMap<String, ToggleCounts>,
}

/// Raw counts for a single feature as reported by an SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToggleCounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<HashMap<String, u64>>,
}

impl ToggleCounts {
    /// Folds explicit and variant counts into a [`YesNoCount`].
    ///
    /// Every variant other than `disabled` counts as `yes`; `disabled`
    /// counts as `no`. Returns `None` if the sum overflows.
    pub fn fold(&self) -> Option<YesNoCount> {
        let mut yes = self.yes.unwrap_or(0);
        let mut no = self.no.unwrap_or(0);

        if let Some(variants) = &self.variants {
            for (name, count) in variants {
                if name == DISABLED_VARIANT {
                    no = no.checked_add(*count)?;
                } else {
                    yes = yes.checked_add(*count)?;
                }
            }
        }

        Some(YesNoCount { yes, no })
    }

    /// Adds `other` into `self` side by side, variants per key. Saturates.
    pub fn merge(&mut self, other: &ToggleCounts) {
        fn sum(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
            }
        }

        self.yes = sum(self.yes, other.yes);
        self.no = sum(self.no, other.no);

        if let Some(theirs) = &other.variants {
            let ours = self.variants.get_or_insert_with(HashMap::new);
            for (name, count) in theirs {
                let slot = ours.entry(name.clone()).or_insert(0);
                *slot = slot.saturating_add(*count);
            }
        }
    }
}

/// Folded evaluation counts for one feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct YesNoCount {
    pub yes: u64,
    pub no: u64,
}

impl YesNoCount {
    pub const ZERO: Self = Self { yes: 0, no: 0 };

    pub const fn new(yes: u64, no: u64) -> Self {
        Self { yes, no }
    }

    /// Total evaluations (`yes + no`), saturating.
    pub fn total(&self) -> u64 {
        self.yes.saturating_add(self.no)
    }

    /// True when either side is non-zero.
    pub fn has_activity(&self) -> bool {
        self.yes > 0 || self.no > 0
    }
}

/// Folded per-feature counts of one bucket, as stored in the ledgers.
pub type BucketCounts = HashMap<String, YesNoCount>;

/// Dedup key for client registrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity {
    pub app_name: String,
    pub instance_id: String,
}

/// A client heartbeat / "I'm alive" announcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub app_name: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub sdk_version: Option<String>,
    #[serde(default)]
    pub strategies: Option<Vec<String>>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub client_ip: Option<String>,
}

impl ClientRegistration {
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            app_name: self.app_name.clone(),
            instance_id: self
                .instance_id
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTANCE_ID.to_string()),
        }
    }

    /// Overlays `newer` onto `self`. Fields present on `newer` win, absent
    /// fields keep the earlier value.
    pub fn merge(&mut self, newer: ClientRegistration) {
        self.app_name = newer.app_name;
        if newer.instance_id.is_some() {
            self.instance_id = newer.instance_id;
        }
        if newer.environment.is_some() {
            self.environment = newer.environment;
        }
        if newer.sdk_version.is_some() {
            self.sdk_version = newer.sdk_version;
        }
        if newer.strategies.is_some() {
            self.strategies = newer.strategies;
        }
        if newer.started.is_some() {
            self.started = newer.started;
        }
        if newer.interval.is_some() {
            self.interval = newer.interval;
        }
        if newer.client_ip.is_some() {
            self.client_ip = newer.client_ip;
        }
    }
}

/// Application row written by the registration flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_name: String,
    pub environment: Option<String>,
    pub sdk_version: Option<String>,
    pub strategies: Vec<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub created_by: Option<String>,
    pub announced: bool,
}

impl From<&ClientRegistration> for Application {
    fn from(reg: &ClientRegistration) -> Self {
        Self {
            app_name: reg.app_name.clone(),
            environment: reg.environment.clone(),
            sdk_version: reg.sdk_version.clone(),
            strategies: reg.strategies.clone().unwrap_or_default(),
            description: None,
            url: None,
            color: None,
            icon: None,
            created_by: reg.client_ip.clone(),
            announced: false,
        }
    }
}

/// Instance row written by the registration flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInstance {
    pub app_name: String,
    pub instance_id: String,
    pub environment: String,
    pub sdk_version: Option<String>,
    pub client_ip: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl ClientInstance {
    pub fn from_registration(reg: &ClientRegistration, last_seen: DateTime<Utc>) -> Self {
        let identity = reg.identity();
        Self {
            app_name: identity.app_name,
            instance_id: identity.instance_id,
            environment: reg
                .environment
                .clone()
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            sdk_version: reg.sdk_version.clone(),
            client_ip: reg.client_ip.clone(),
            last_seen,
        }
    }
}

/// Per-feature usage derived from a report; input to last-seen tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureUsage {
    pub feature_name: String,
    pub environment: String,
    pub yes: u64,
    pub no: u64,
}

/// Key under which last-seen entries are buffered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LastSeenKey {
    pub feature_name: String,
    pub environment: String,
}

/// One "feature was evaluated in environment" mark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSeenInput {
    pub feature_name: String,
    pub environment: String,
}

/// Domain event emitted once per newly announced application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCreatedEvent {
    pub created_by: String,
    pub data: Application,
}

impl ApplicationCreatedEvent {
    pub fn for_application(app: Application) -> Self {
        Self {
            created_by: app
                .created_by
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            data: app,
        }
    }
}

/// A report as read back from the metrics store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReport {
    pub id: i64,
    pub report: UsageReport,
}

/// Per-application usage kept in memory by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppToggles {
    pub app_name: String,
    pub seen_toggles: Vec<String>,
    pub metrics_count: u64,
}
