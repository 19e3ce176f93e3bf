use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the flagwatch service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error), used when `--log-level`
    /// is not given. Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sliding-window aggregation and usage-row persistence.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Client registration batching.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Application announcement.
    #[serde(default)]
    pub announcement: AnnouncementConfig,

    /// Last-seen batching.
    #[serde(default)]
    pub last_seen: LastSeenConfig,

    /// Loading stored reports into memory.
    #[serde(default)]
    pub hydration: HydrationConfig,

    /// Periodic cleanup of old stored data.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Sliding-window aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Span of the short window. Default: 60s.
    #[serde(default = "default_minute_window", with = "humantime_serde")]
    pub minute_window: Duration,

    /// Span of the long window. Default: 1h.
    #[serde(default = "default_hour_window", with = "humantime_serde")]
    pub hour_window: Duration,

    /// How often expired buckets are evicted. Default: 10s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How often buffered hourly usage rows are written. Default: 5s.
    #[serde(default = "default_metrics_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Distinct hourly rows buffered before reports opening a new row are
    /// dropped. Default: 8192.
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// How often buffered registrations are written. Default: 5s.
    #[serde(default = "default_registration_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncementConfig {
    /// How often new applications are announced. Default: 5m.
    #[serde(default = "default_announcement_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastSeenConfig {
    /// How often buffered last-seen marks are written. Default: 30s.
    #[serde(default = "default_last_seen_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Hydration of in-memory windows from the metrics store.
#[derive(Debug, Clone, Deserialize)]
pub struct HydrationConfig {
    /// Replay the last hour of stored reports at start-up. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poll the store for reports written by other instances. Disabled
    /// when unset.
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// How often the retention job runs. Default: 1h.
    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Stored reports older than this are deleted. Default: 48h.
    #[serde(default = "default_metrics_max_age", with = "humantime_serde")]
    pub metrics_max_age: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_minute_window() -> Duration {
    Duration::from_secs(60)
}

fn default_hour_window() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_write_buffer_size() -> usize {
    8192
}

fn default_registration_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_announcement_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_last_seen_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_metrics_max_age() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
            registration: RegistrationConfig::default(),
            announcement: AnnouncementConfig::default(),
            last_seen: LastSeenConfig::default(),
            hydration: HydrationConfig::default(),
            retention: RetentionConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            minute_window: default_minute_window(),
            hour_window: default_hour_window(),
            sweep_interval: default_sweep_interval(),
            flush_interval: default_metrics_flush_interval(),
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_registration_flush_interval(),
        }
    }
}

impl Default for AnnouncementConfig {
    fn default() -> Self {
        Self {
            interval: default_announcement_interval(),
        }
    }
}

impl Default for LastSeenConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_last_seen_flush_interval(),
        }
    }
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval: None,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: default_retention_interval(),
            metrics_max_age: default_metrics_max_age(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        let m = &self.metrics;
        if m.minute_window.is_zero() {
            bail!("metrics.minute_window must be positive");
        }
        if m.hour_window.is_zero() {
            bail!("metrics.hour_window must be positive");
        }
        if m.hour_window < m.minute_window {
            bail!(
                "metrics.hour_window ({:?}) must not be shorter than metrics.minute_window ({:?})",
                m.hour_window,
                m.minute_window,
            );
        }
        if m.sweep_interval.is_zero() {
            bail!("metrics.sweep_interval must be positive");
        }
        if m.flush_interval.is_zero() {
            bail!("metrics.flush_interval must be positive");
        }
        if m.write_buffer_size == 0 {
            bail!("metrics.write_buffer_size must be positive");
        }

        if self.registration.flush_interval.is_zero() {
            bail!("registration.flush_interval must be positive");
        }
        if self.announcement.interval.is_zero() {
            bail!("announcement.interval must be positive");
        }
        if self.last_seen.flush_interval.is_zero() {
            bail!("last_seen.flush_interval must be positive");
        }

        if let Some(poll) = self.hydration.poll_interval {
            if poll.is_zero() {
                bail!("hydration.poll_interval must be positive when set");
            }
        }

        if self.retention.interval.is_zero() {
            bail!("retention.interval must be positive");
        }
        if self.retention.metrics_max_age < m.hour_window {
            bail!("retention.metrics_max_age must cover at least metrics.hour_window");
        }

        Ok(())
    }
}
