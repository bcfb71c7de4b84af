use super::response::{
    default_rejection, merge_headers, rate_limit_headers, RejectionHandler, RETRY_AFTER,
};
use crate::error::RateLimiterError;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Window state reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Requests left in the current window
    pub remaining: u32,
    /// Unix timestamp (ms) at which the window ends
    pub reset: u64,
    /// Configured maximum per window
    pub limit: u32,
    /// Whether this request was over the limit
    pub exceeded: bool,
}

/// Rate limit result for one request
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub status: RateLimitStatus,
    /// Whether the request may proceed
    pub is_allowed: bool,
    /// `X-RateLimit-*` headers describing `status`
    pub headers: HeaderMap,
    /// Set when the limiter or its backend failed
    pub error: Option<RateLimiterError>,
    retry_after: Option<u64>,
    on_error: Option<RejectionHandler>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(status: RateLimitStatus) -> Self {
        Self {
            headers: rate_limit_headers(&status),
            status,
            is_allowed: true,
            error: None,
            retry_after: None,
            on_error: None,
        }
    }

    /// Create a rejected result; `Retry-After` is counted from `now` (ms)
    pub fn rejected(status: RateLimitStatus, now: u64, on_error: Option<RejectionHandler>) -> Self {
        let retry_after = status.reset.saturating_sub(now).div_ceil(1000);

        Self {
            headers: rate_limit_headers(&status),
            status,
            is_allowed: false,
            error: None,
            retry_after: Some(retry_after),
            on_error,
        }
    }

    /// Create a result for a failed check
    pub fn failed(error: RateLimiterError, limit: u32, now: u64) -> Self {
        let status = RateLimitStatus {
            remaining: 0,
            reset: now,
            limit,
            exceeded: false,
        };

        Self {
            headers: rate_limit_headers(&status),
            status,
            is_allowed: false,
            error: Some(error),
            retry_after: None,
            on_error: None,
        }
    }

    /// Seconds until the window reopens, for rejected requests
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    /// Render the response for this result
    ///
    /// Errors become a 500 carrying the error code, rejections a 429 (or the
    /// custom rejection handler's response) and allowed requests an empty 200.
    /// The rate limit headers are set on all three, plus `Retry-After` on
    /// rejections.
    pub fn build_response(&self) -> Response {
        let mut response = if let Some(error) = &self.error {
            error.clone().into_response()
        } else if !self.is_allowed {
            match &self.on_error {
                Some(handler) => handler.call(self.status.remaining, self.status.reset),
                None => default_rejection(self.retry_after.unwrap_or_default()),
            }
        } else {
            StatusCode::OK.into_response()
        };

        merge_headers(response.headers_mut(), &self.headers);
        if let Some(retry_after) = self.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

impl IntoResponse for RateLimitResult {
    fn into_response(self) -> Response {
        self.build_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn status(remaining: u32, exceeded: bool) -> RateLimitStatus {
        RateLimitStatus {
            remaining,
            reset: 1_700_000_010_000,
            limit: 5,
            exceeded,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_allowed_result_headers() {
        let result = RateLimitResult::allowed(status(3, false));
        assert!(result.is_allowed);
        assert_eq!(result.headers.get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(result.headers.get("x-ratelimit-remaining").unwrap(), "3");
        assert_eq!(result.headers.get("x-ratelimit-reset").unwrap(), "1700000010");
        assert!(result.headers.get(RETRY_AFTER).is_none());

        let response = result.build_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "3");
    }

    #[tokio::test]
    async fn test_rejected_result_default_body() {
        let result = RateLimitResult::rejected(status(0, true), 1_700_000_002_500, None);
        assert_eq!(result.retry_after(), Some(8));
        assert_eq!(result.headers.len(), 3);
        assert!(result.headers.get(RETRY_AFTER).is_none());

        let response = result.build_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "8");
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Too Many Requests", "retryAfter": 8})
        );
    }

    #[tokio::test]
    async fn test_rejected_result_uses_custom_handler() {
        let handler = RejectionHandler::new(|remaining, reset| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("slow down {} {}", remaining, reset),
            )
                .into_response()
        });
        let result = RateLimitResult::rejected(status(0, true), 1_700_000_000_000, Some(handler));

        let response = result.build_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "10");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"slow down 0 1700000010000");
    }

    #[tokio::test]
    async fn test_failed_result_is_server_error() {
        let error = RateLimiterError::InvalidSchema("bad column".to_string());
        let result = RateLimitResult::failed(error, 5, 1_000);
        assert!(!result.is_allowed);
        assert!(!result.status.exceeded);

        let response = result.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "bad column", "code": "INVALID_SCHEMA"})
        );
    }
}
