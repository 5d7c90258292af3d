//! Aggregated health endpoint.
//!
//! 200 when at least one consumer is connected and consuming, the state store
//! answers its ping, and resident memory sits below the configured threshold;
//! 503 otherwise. The body carries the full picture either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use serde_json::{Value, json};

use guildsmith_consumer::{ConsumerStatus, QueueConsumer};
use guildsmith_kv::StateStore;
use guildsmith_telemetry::PrometheusHandle;

pub struct HealthState {
    consumers: Vec<Arc<QueueConsumer>>,
    state: StateStore,
    memory_threshold_mb: u64,
    started_at: Instant,
    metrics: PrometheusHandle,
}

impl HealthState {
    pub fn new(
        consumers: Vec<Arc<QueueConsumer>>,
        state: StateStore,
        memory_threshold_mb: u64,
        metrics: PrometheusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumers,
            state,
            memory_threshold_mb,
            started_at: Instant::now(),
            metrics,
        })
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<Value>) {
    let consumers: Vec<(String, ConsumerStatus)> = state
        .consumers
        .iter()
        .map(|c| (c.queue().to_string(), c.status()))
        .collect();
    let kv = state
        .state
        .ping()
        .await
        .map_err(|err| err.to_string());
    let memory_mb = process_memory_mb();
    let (healthy, body) = evaluate(
        &consumers,
        kv,
        memory_mb,
        state.memory_threshold_mb,
        state.started_at.elapsed(),
    );
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> String {
    state.metrics.render()
}

/// Pure health decision over collected inputs; the handler above only
/// gathers. An unreadable memory probe does not degrade health on its own.
fn evaluate(
    consumers: &[(String, ConsumerStatus)],
    kv: Result<Duration, String>,
    memory_mb: Option<u64>,
    memory_threshold_mb: u64,
    uptime: Duration,
) -> (bool, Value) {
    let consuming = consumers
        .iter()
        .any(|(_, s)| s.connected && s.consuming);
    let kv_healthy = kv.is_ok();
    let memory_ok = memory_mb.map(|mb| mb < memory_threshold_mb).unwrap_or(true);
    let healthy = consuming && kv_healthy && memory_ok;

    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "uptimeSeconds": uptime.as_secs(),
        "memoryMb": memory_mb,
        "memoryThresholdMb": memory_threshold_mb,
        "kv": {
            "healthy": kv_healthy,
            "latencyMs": kv.as_ref().ok().map(|d| d.as_secs_f64() * 1000.0),
            "error": kv.as_ref().err(),
        },
        "consumers": consumers.iter().map(|(queue, s)| json!({
            "queue": queue,
            "connected": s.connected,
            "consuming": s.consuming,
            "messagesProcessed": s.messages_processed,
            "messagesErrored": s.messages_errored,
        })).collect::<Vec<_>>(),
    });
    (healthy, body)
}

fn process_memory_mb() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = sysinfo::System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid).map(|p| p.memory() / (1024 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consuming_status() -> ConsumerStatus {
        ConsumerStatus {
            connected: true,
            consuming: true,
            messages_processed: 10,
            messages_errored: 1,
        }
    }

    #[test]
    fn healthy_when_consuming_and_kv_up() {
        let consumers = vec![("events".to_string(), consuming_status())];
        let (healthy, body) = evaluate(
            &consumers,
            Ok(Duration::from_millis(2)),
            Some(100),
            512,
            Duration::from_secs(60),
        );
        assert!(healthy);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["consumers"][0]["messagesProcessed"], 10);
    }

    #[test]
    fn degraded_when_no_consumer_is_consuming() {
        let stopped = ConsumerStatus {
            connected: true,
            consuming: false,
            ..ConsumerStatus::default()
        };
        let consumers = vec![("events".to_string(), stopped)];
        let (healthy, body) = evaluate(
            &consumers,
            Ok(Duration::from_millis(2)),
            Some(100),
            512,
            Duration::ZERO,
        );
        assert!(!healthy);
        assert_eq!(body["status"], "degraded");
    }

    #[test]
    fn degraded_when_kv_is_down() {
        let consumers = vec![("events".to_string(), consuming_status())];
        let (healthy, body) = evaluate(
            &consumers,
            Err("state store unavailable: timeout".into()),
            Some(100),
            512,
            Duration::ZERO,
        );
        assert!(!healthy);
        assert_eq!(body["kv"]["healthy"], false);
        assert!(body["kv"]["error"].as_str().unwrap().contains("unavailable"));
    }

    #[test]
    fn degraded_when_memory_exceeds_threshold() {
        let consumers = vec![("events".to_string(), consuming_status())];
        let (healthy, _) = evaluate(
            &consumers,
            Ok(Duration::from_millis(1)),
            Some(600),
            512,
            Duration::ZERO,
        );
        assert!(!healthy);
    }

    #[test]
    fn unknown_memory_does_not_degrade() {
        let consumers = vec![("events".to_string(), consuming_status())];
        let (healthy, _) = evaluate(
            &consumers,
            Ok(Duration::from_millis(1)),
            None,
            512,
            Duration::ZERO,
        );
        assert!(healthy);
    }
}
