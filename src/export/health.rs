use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "flagwatch";

/// Prometheus metrics for the metrics pipeline.
///
/// All metrics use the "flagwatch" namespace. Ingest-path metrics are
/// plain counters so the hot path never touches a label map.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Usage reports accepted.
    pub reports_ingested: Counter,
    /// Reports and registrations rejected by validation, by field.
    pub validation_failures: CounterVec,
    /// Feature evaluations (yes + no) accepted.
    pub evaluations: Counter,
    /// Reports dropped because the write buffer was full or closed.
    pub write_buffer_dropped: Counter,
    /// Hourly rows waiting in the write buffer.
    pub write_buffer_rows: Gauge,
    /// Reports applied from the metrics store by source (replay/poll).
    pub reports_hydrated: CounterVec,
    /// Buckets evicted from a window ledger, by window.
    pub ledger_evictions: CounterVec,

    // === Persistence ===
    /// Hourly usage rows written to the metrics store.
    pub metrics_rows_flushed: Counter,
    /// Store call failures by operation.
    pub store_errors: CounterVec,
    /// Background flush duration by flush kind.
    pub flush_duration: HistogramVec,
    /// Client instances written by registration flushes.
    pub instances_flushed: Counter,
    /// Applications written by registration flushes.
    pub applications_flushed: Counter,
    /// Applications announced.
    pub applications_announced: Counter,
    /// Last-seen entries written.
    pub last_seen_flushed: Counter,
    /// Registrations from SDKs below their minimum supported version.
    pub outdated_sdk_registrations: Counter,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let reports_ingested = counter("reports_ingested_total", "Total usage reports accepted.")?;
        let validation_failures = counter_vec(
            "validation_failures_total",
            "Total reports and registrations rejected by validation.",
            &["field"],
        )?;
        let evaluations = counter(
            "evaluations_total",
            "Total feature evaluations (yes + no) accepted.",
        )?;
        let write_buffer_dropped = counter(
            "write_buffer_dropped_total",
            "Total reports dropped because the write buffer was full or closed.",
        )?;
        let write_buffer_rows = Gauge::with_opts(
            Opts::new(
                "write_buffer_rows",
                "Hourly usage rows waiting for the next metrics flush.",
            )
            .namespace(NAMESPACE),
        )?;
        let reports_hydrated = counter_vec(
            "reports_hydrated_total",
            "Total stored reports applied to the in-memory windows.",
            &["source"],
        )?;
        let ledger_evictions = counter_vec(
            "ledger_evictions_total",
            "Total buckets evicted from a sliding window.",
            &["window"],
        )?;

        // === Persistence ===
        let metrics_rows_flushed = counter(
            "metrics_rows_flushed_total",
            "Total hourly usage rows written to the metrics store.",
        )?;
        let store_errors = counter_vec(
            "store_errors_total",
            "Total failed store calls by operation.",
            &["operation"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time spent in a background flush by kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["flush"],
        )?;
        let instances_flushed = counter(
            "instances_flushed_total",
            "Total client instances written by registration flushes.",
        )?;
        let applications_flushed = counter(
            "applications_flushed_total",
            "Total applications written by registration flushes.",
        )?;
        let applications_announced = counter(
            "applications_announced_total",
            "Total applications announced.",
        )?;
        let last_seen_flushed = counter(
            "last_seen_flushed_total",
            "Total last-seen entries written.",
        )?;
        let outdated_sdk_registrations = counter(
            "outdated_sdk_registrations_total",
            "Total registrations from SDKs below the supported minimum version.",
        )?;

        registry.register(Box::new(reports_ingested.clone()))?;
        registry.register(Box::new(validation_failures.clone()))?;
        registry.register(Box::new(evaluations.clone()))?;
        registry.register(Box::new(write_buffer_dropped.clone()))?;
        registry.register(Box::new(write_buffer_rows.clone()))?;
        registry.register(Box::new(reports_hydrated.clone()))?;
        registry.register(Box::new(ledger_evictions.clone()))?;

        registry.register(Box::new(metrics_rows_flushed.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(instances_flushed.clone()))?;
        registry.register(Box::new(applications_flushed.clone()))?;
        registry.register(Box::new(applications_announced.clone()))?;
        registry.register(Box::new(last_seen_flushed.clone()))?;
        registry.register(Box::new(outdated_sdk_registrations.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            reports_ingested,
            validation_failures,
            evaluations,
            write_buffer_dropped,
            write_buffer_rows,
            reports_hydrated,
            ledger_evictions,
            metrics_rows_flushed,
            store_errors,
            flush_duration,
            instances_flushed,
            applications_flushed,
            applications_announced,
            last_seen_flushed,
            outdated_sdk_registrations,
        })
    }

    /// Records a failed store call.
    pub fn record_store_error(&self, operation: &str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }

    /// Renders the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_namespaced() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.reports_ingested.inc();
        health.record_store_error("metrics_batch_insert");
        health
            .ledger_evictions
            .with_label_values(&["minute"])
            .inc_by(3.0);

        let text = health.encode().expect("encode");
        assert!(text.contains("flagwatch_reports_ingested_total 1"));
        assert!(text.contains("flagwatch_store_errors_total{operation=\"metrics_batch_insert\"} 1"));
        assert!(text.contains("flagwatch_ledger_evictions_total{window=\"minute\"} 3"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("server starts");
        health.stop().await.expect("server stops");
        // A second stop has nothing left to cancel.
        health.stop().await.expect("idempotent stop");
    }
}
