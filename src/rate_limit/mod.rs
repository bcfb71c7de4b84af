//! Fixed-window rate limiting
//!
//! Each request resolves to a key (the client IP, optionally prefixed), the
//! configured backend applies one fixed-window step for that key and the
//! outcome comes back as a [`RateLimitResult`] carrying status, headers and a
//! ready-made response.
//!
//! # Example
//!
//! ```rust,no_run
//! use axum::{middleware, routing::get, Router};
//! use rate_gate::config::RateLimiterOptions;
//! use rate_gate::rate_limit::{create_rate_limiter, rate_limit_middleware};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = create_rate_limiter(RateLimiterOptions::new(100, 60)).await;
//!
//!     let app: Router = Router::new()
//!         .route("/", get(|| async { "hello" }))
//!         .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));
//! }
//! ```

pub mod engine;
pub mod middleware;
pub mod response;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use engine::{decide, Decision, RateLimiter};
pub use middleware::rate_limit_middleware;
pub use response::{add_rate_limit_headers, RejectionHandler};
pub use service::{create_rate_limiter, create_rate_limiter_with_clock, LimiterHandle};
pub use types::{RateLimitResult, RateLimitStatus};
