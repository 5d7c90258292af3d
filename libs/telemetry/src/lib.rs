//! Lightweight facade around tracing-subscriber and the metrics recorder.
//!
//! ```no_run
//! guildsmith_telemetry::init_telemetry("guildsmith-worker").expect("telemetry");
//! tracing::info!("telemetry configured");
//! ```

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub use metrics_exporter_prometheus::PrometheusHandle;

/// Metric names shared across crates. Label schemas follow Prometheus
/// conventions; every name is listed here so dashboards have one source.
pub mod names {
    /// Counter, labels `operation`, `status`.
    pub const OPERATIONS_TOTAL: &str = "operations_total";
    /// Histogram (seconds), label `operation`.
    pub const OPERATION_LATENCY_SECONDS: &str = "operation_latency_seconds";
    /// Counter, label `type`.
    pub const JOBS_ENQUEUED_TOTAL: &str = "jobs_enqueued_total";
    /// Counter, label `type`.
    pub const JOBS_COMPLETED_TOTAL: &str = "jobs_completed_total";
    /// Counter, labels `type`, `reason`.
    pub const JOBS_FAILED_TOTAL: &str = "jobs_failed_total";
    /// Counter, label `type`.
    pub const JOBS_RETRIED_TOTAL: &str = "jobs_retried_total";
    pub const IDEMPOTENCY_HITS_TOTAL: &str = "idempotency_hits_total";
    pub const IDEMPOTENCY_MISSES_TOTAL: &str = "idempotency_misses_total";
    /// Counter, labels `type`, `guild`, `global`.
    pub const PLATFORM_429_TOTAL: &str = "platform_429_total";
    /// Gauge, label `state`.
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const TOKEN_BUCKET_AVAILABLE: &str = "token_bucket_available";
    /// Counter, labels `queue`, `outcome`.
    pub const CONSUMER_MESSAGES_TOTAL: &str = "consumer_messages_total";
}

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initializes the global tracing subscriber. `RUST_LOG` controls filtering;
/// `LOG_FORMAT=json` switches to line-delimited JSON output.
pub fn init_telemetry(service: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{}=debug", service.replace('-', "_"))));
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A second init (tests, embedded runtimes) keeps the first subscriber.
    if result.is_err() {
        tracing::debug!(service, "tracing subscriber already installed");
    }
    Ok(())
}

/// Installs the process-wide Prometheus recorder and returns the render
/// handle. Idempotent: later calls return the handle installed first.
pub fn install_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS.set(handle.clone());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_reentrant() {
        init_telemetry("guildsmith-test").unwrap();
        init_telemetry("guildsmith-test").unwrap();
    }

    #[test]
    fn metrics_handle_is_shared() {
        let handle = install_metrics().unwrap();
        metrics::counter!(names::IDEMPOTENCY_HITS_TOTAL).increment(1);
        assert!(handle.render().contains(names::IDEMPOTENCY_HITS_TOTAL));
        // Second install returns the same recorder instead of failing.
        install_metrics().unwrap();
    }
}
