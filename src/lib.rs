pub mod client_ip;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod storage;

use crate::config::GateConfig;
use crate::error::{RateLimiterError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::rate_limit::{create_rate_limiter, rate_limit_middleware, LimiterHandle};
use axum::{middleware, routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Build the demo application
///
/// `/` is rate limited; `/metrics` is served outside the limiter when a
/// metrics service is supplied.
pub fn build_app(limiter: LimiterHandle, metrics: Option<MetricsService>) -> Router {
    let limited = Router::new()
        .route("/", get(hello))
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    let app = match metrics {
        Some(service) => limited.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(service),
        ),
        None => limited,
    };

    app.layer(TraceLayer::new_for_http())
}

async fn hello() -> Json<serde_json::Value> {
    Json(json!({ "message": "Hello, world!" }))
}

/// Start the demo server
pub async fn run_server(config: GateConfig) -> Result<()> {
    let limiter = create_rate_limiter(config.rate_limit.clone()).await;
    if let Some(e) = limiter.error() {
        warn!(code = e.code(), "Serving with a failed rate limiter: {}", e);
    }

    let metrics = match MetricsService::new() {
        Ok(service) => Some(service),
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };

    let app = build_app(limiter.clone(), metrics);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        RateLimiterError::invalid_configuration(format!("Failed to bind {}: {}", addr, e))
    })?;

    info!(
        limit = config.rate_limit.limit,
        window = config.rate_limit.window,
        storage = config.rate_limit.storage.name(),
        "Listening on {}",
        addr
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    limiter.destroy().await;

    served.map_err(|e| RateLimiterError::invalid_configuration(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize tracing/logging
///
/// `RUST_LOG` takes precedence; otherwise `debug` raises this crate to debug level.
pub fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "rate_gate=debug,tower_http=debug"
    } else {
        "rate_gate=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(true)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimiterOptions;
    use crate::rate_limit::RateLimiter;
    use crate::storage::{MemoryStorage, MemoryStore};
    use axum::{body::Body, http::Request, http::StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_hello_route_is_limited() {
        let clock = Arc::new(ManualClock::new(0));
        let storage = Arc::new(MemoryStorage::new(Arc::new(MemoryStore::new()), clock.clone()));
        let limiter =
            RateLimiter::with_storage(RateLimiterOptions::new(1, 10), storage, clock).unwrap();
        let app = build_app(limiter.into(), None);

        let request = || {
            Request::builder()
                .uri("/")
                .header("x-real-ip", "3.3.3.3")
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
