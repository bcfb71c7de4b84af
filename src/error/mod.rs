use crate::config::ColumnNames;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Result type for rate limiter operations
pub type Result<T> = std::result::Result<T, RateLimiterError>;

/// Rate limiter error types
///
/// Every variant carries a stable string code (see [`RateLimiterError::code`]) so
/// callers can tell infrastructure failures apart from throttling without
/// matching on messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimiterError {
    #[error("{0}")]
    InvalidConfiguration(String),

    #[error("{0}")]
    SchemaNotFound(String),

    #[error("{0}")]
    InvalidSchema(String),

    #[error("Database error: {0}")]
    DatabaseConnection(String),

    #[error("Database URL is required. Please set the DATABASE_URL environment variable.")]
    DatabaseUrlNotFound,
}

impl RateLimiterError {
    /// Build a configuration error and log it
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into()).logged()
    }

    /// Build the "table missing" error carrying the DDL needed to create it
    pub fn schema_not_found(schema: &str, table: &str, columns: &ColumnNames) -> Self {
        Self::SchemaNotFound(format!(
            "Rate limiter requires a database table. Run these SQL commands: \
             CREATE TABLE {schema}.{table} ({id} VARCHAR(255) PRIMARY KEY, \
             {count} INTEGER NOT NULL, {reset} INTEGER NOT NULL, \
             {created_at} TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             {updated_at} TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP); \
             CREATE INDEX {table}_reset_idx ON {schema}.{table}({reset});",
            id = columns.id,
            count = columns.count,
            reset = columns.reset,
            created_at = columns.created_at,
            updated_at = columns.updated_at,
        ))
        .logged()
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema(message.into()).logged()
    }

    pub fn database_connection(message: impl std::fmt::Display) -> Self {
        Self::DatabaseConnection(message.to_string()).logged()
    }

    pub fn database_url_not_found() -> Self {
        Self::DatabaseUrlNotFound.logged()
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            RateLimiterError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            RateLimiterError::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            RateLimiterError::InvalidSchema(_) => "INVALID_SCHEMA",
            RateLimiterError::DatabaseConnection(_) => "DATABASE_CONNECTION_ERROR",
            RateLimiterError::DatabaseUrlNotFound => "DATABASE_URL_NOT_FOUND",
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn logged(self) -> Self {
        error!(code = self.code(), "{}", self);
        self
    }
}

impl IntoResponse for RateLimiterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        RateLimiterError::database_connection(format!("Redis error: {}", err))
    }
}
