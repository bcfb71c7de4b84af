use crate::error::{RateLimiterError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

pub const REQUESTS_TOTAL: &str = "rate_gate_requests_total";
pub const STORAGE_DURATION: &str = "rate_gate_storage_duration_seconds";

pub const OUTCOME_ALLOWED: &str = "allowed";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_ERROR: &str = "error";

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    ///
    /// Fails if a recorder is already installed in this process.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            RateLimiterError::invalid_configuration(format!(
                "Failed to install metrics recorder: {}",
                e
            ))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            REQUESTS_TOTAL,
            "Rate limit checks by outcome (allowed, rejected, error)"
        );
        describe_histogram!(
            STORAGE_DURATION,
            "Latency of storage backend operations in seconds"
        );

        debug!("Rate limit metrics registered");
    }

    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// `GET /metrics` handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Count one rate limit decision
pub fn record_decision(outcome: &'static str) {
    counter!(REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record how long a storage call took
pub fn record_storage_duration(backend: &'static str, op: &'static str, seconds: f64) {
    histogram!(STORAGE_DURATION, "backend" => backend, "op" => op).record(seconds);
}
