use super::response::add_rate_limit_headers;
use super::service::LimiterHandle;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tracing::debug;

/// Axum middleware function for rate limiting
///
/// Mount with `axum::middleware::from_fn_with_state(handle, rate_limit_middleware)`.
/// The transport address is read from `ConnectInfo` when the server was started
/// with `into_make_service_with_connect_info`; otherwise only headers are used.
pub async fn rate_limit_middleware(
    State(limiter): State<LimiterHandle>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let result = limiter.handle_request(request.headers(), remote_addr).await;

    if !result.is_allowed {
        debug!(
            path = %request.uri().path(),
            remaining = result.status.remaining,
            "Request blocked by rate limiter"
        );
        return result.build_response();
    }

    let response = next.run(request).await;
    add_rate_limit_headers(response, &result.headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimiterOptions;
    use crate::rate_limit::engine::RateLimiter;
    use crate::storage::{MemoryStorage, MemoryStore};
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(limit: u32) -> Router {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let storage = Arc::new(MemoryStorage::new(Arc::new(MemoryStore::new()), clock.clone()));
        let limiter =
            RateLimiter::with_storage(RateLimiterOptions::new(limit, 10), storage, clock).unwrap();

        Router::new()
            .route("/", get(|| async { "hello" }))
            .layer(middleware::from_fn_with_state(
                LimiterHandle::from(limiter),
                rate_limit_middleware,
            ))
    }

    fn request_from(addr: &str) -> Request {
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[tokio::test]
    async fn test_allowed_response_carries_headers() {
        let response = app(2)
            .oneshot(request_from("10.1.1.1:5000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "2");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "1");
        assert_eq!(response.headers().get("x-ratelimit-reset").unwrap(), "1700000010");
    }

    #[tokio::test]
    async fn test_connect_info_address_is_the_key() {
        let app = app(1);

        let first = app.clone().oneshot(request_from("10.1.1.1:5000")).await.unwrap();
        let second = app.clone().oneshot(request_from("10.1.1.1:5001")).await.unwrap();
        let other = app.oneshot(request_from("10.1.1.2:5000")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers().get("retry-after").unwrap(), "10");
        assert_eq!(other.status(), StatusCode::OK);
    }
}
