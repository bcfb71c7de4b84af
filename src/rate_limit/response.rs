use super::types::RateLimitStatus;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RETRY_AFTER: HeaderName = axum::http::header::RETRY_AFTER;

type HandlerFn = dyn Fn(u32, u64) -> Response + Send + Sync;

/// Custom response builder for rejected requests
///
/// Called with the remaining count and the window reset (unix ms). The rate
/// limit headers are merged into whatever it returns.
#[derive(Clone)]
pub struct RejectionHandler(Arc<HandlerFn>);

impl RejectionHandler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(u32, u64) -> Response + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    pub fn call(&self, remaining: u32, reset: u64) -> Response {
        (self.0)(remaining, reset)
    }
}

impl fmt::Debug for RejectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RejectionHandler(..)")
    }
}

/// `X-RateLimit-*` headers for a status; the reset is sent in unix seconds
pub fn rate_limit_headers(status: &RateLimitStatus) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(status.reset.div_ceil(1000)));
    headers
}

/// Default 429 body: `{"error": "Too Many Requests", "retryAfter": n}`
pub fn default_rejection(retry_after: u64) -> Response {
    let body = Json(json!({
        "error": "Too Many Requests",
        "retryAfter": retry_after,
    }));

    (StatusCode::TOO_MANY_REQUESTS, body).into_response()
}

/// Copy `extra` into `headers`, replacing same-named entries
pub fn merge_headers(headers: &mut HeaderMap, extra: &HeaderMap) {
    for (name, value) in extra {
        headers.insert(name.clone(), value.clone());
    }
}

/// Add rate limit headers to a downstream response
pub fn add_rate_limit_headers(mut response: Response, headers: &HeaderMap) -> Response {
    merge_headers(response.headers_mut(), headers);
    response
}
