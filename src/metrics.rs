//! Prometheus metrics and liveness surface for the collection engine.

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;

lazy_static! {
    /// Total number of readings ingested per device/point.
    pub static ref READINGS_INGESTED: CounterVec = register_counter_vec!(
        "pulseone_readings_ingested_total",
        "Total number of readings ingested",
        &["device_id", "point_id"]
    )
    .unwrap();

    /// Number of active protocol driver connections, per device.
    pub static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        "pulseone_active_connections",
        "Number of active protocol driver connections",
        &["device_id", "protocol"]
    )
    .unwrap();

    /// Driver connection/read/write errors.
    pub static ref DRIVER_ERRORS: CounterVec = register_counter_vec!(
        "pulseone_driver_errors_total",
        "Total number of protocol driver errors",
        &["device_id", "protocol", "error_type"]
    )
    .unwrap();

    /// Cache sink write latency.
    pub static ref CACHE_WRITE_LATENCY: HistogramVec = register_histogram_vec!(
        "pulseone_cache_write_duration_seconds",
        "Time taken to write a reading to the cache sink",
        &["device_id"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();

    /// History sink batch write latency.
    pub static ref HISTORY_WRITE_LATENCY: HistogramVec = register_histogram_vec!(
        "pulseone_history_write_duration_seconds",
        "Time taken to flush a batch to the history sink",
        &["device_id"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();

    /// History sink batch size.
    pub static ref HISTORY_BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "pulseone_history_batch_size",
        "Number of points per history sink flush",
        &["device_id"],
        vec![10.0, 50.0, 100.0, 500.0, 1000.0]
    )
    .unwrap();

    /// Worker state, exposed as a 0/1 gauge per (device_id, state) pair.
    pub static ref WORKER_STATE: GaugeVec = register_gauge_vec!(
        "pulseone_worker_state",
        "Current worker state (1 for the active state, 0 otherwise)",
        &["device_id", "state"]
    )
    .unwrap();
}

/// Liveness probe, wired to the Worker Manager so `/healthz` reflects
/// whether the fleet is actually up, not just that the HTTP listener is.
pub trait HealthCheck: Send + Sync {
    fn is_healthy(&self) -> bool;
}

pub struct MetricsServer {
    port: u16,
    health: Arc<dyn HealthCheck>,
}

impl MetricsServer {
    pub fn new(port: u16, health: Arc<dyn HealthCheck>) -> Self {
        Self { port, health }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let health = self.health;
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(move || healthz_handler(health.clone())));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

async fn healthz_handler(health: Arc<dyn HealthCheck>) -> (axum::http::StatusCode, &'static str) {
    if health.is_healthy() {
        (axum::http::StatusCode::OK, "ok")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}
