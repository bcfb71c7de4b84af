use crate::error::{RateLimiterError, Result};
use crate::rate_limit::response::RejectionHandler;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when no Postgres connection string is configured
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Prefix for environment overrides applied by [`GateConfig::load`]
pub const ENV_PREFIX: &str = "RATE_GATE";

/// Longest accepted window (one year); keeps window ends in range of millisecond and i64 math
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Configuration for the demo server binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiter configuration
    pub rate_limit: RateLimiterOptions,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Rate limiter configuration
///
/// Validated once when the limiter is created; see [`RateLimiterOptions::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    /// Maximum number of requests allowed within the window
    pub limit: u32,
    /// Time window in seconds
    pub window: u64,
    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,
    /// Namespace prepended to every client key
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Enable verbose per-request logging
    #[serde(default)]
    pub debug: bool,
    /// Override for the body of rejected requests
    #[serde(skip)]
    pub on_error: Option<RejectionHandler>,
}

/// Storage backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-wide in-memory store
    #[default]
    Memory,
    /// Redis with native TTL expiration
    Redis(RedisStorageOptions),
    /// PostgreSQL table
    Postgres(DatabaseStorageOptions),
    /// In-process single-writer actor per key
    Actor,
}

impl StorageConfig {
    /// Short backend name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            StorageConfig::Memory => "memory",
            StorageConfig::Redis(_) => "redis",
            StorageConfig::Postgres(_) => "postgres",
            StorageConfig::Actor => "actor",
        }
    }
}

/// Redis storage options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedisStorageOptions {
    /// Redis connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Prefix for Redis keys
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    /// How often the (no-op) cleanup timer fires, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// PostgreSQL storage options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseStorageOptions {
    /// Database connection string, `DATABASE_URL` is used when absent
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Table name, optionally schema-qualified
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Column name mappings
    #[serde(default)]
    pub columns: ColumnNames,
    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Column names of the rate limit table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnNames {
    #[serde(default = "default_id_column")]
    pub id: String,
    #[serde(default = "default_count_column")]
    pub count: String,
    #[serde(default = "default_reset_column")]
    pub reset: String,
    #[serde(default = "default_created_at_column")]
    pub created_at: String,
    #[serde(default = "default_updated_at_column")]
    pub updated_at: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_redis_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_table_name() -> String {
    "rate_limit_entries".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_count_column() -> String {
    "count".to_string()
}

fn default_reset_column() -> String {
    "reset".to_string()
}

fn default_created_at_column() -> String {
    "created_at".to_string()
}

fn default_updated_at_column() -> String {
    "updated_at".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RedisStorageOptions {
    fn default() -> Self {
        Self {
            url: None,
            prefix: default_redis_prefix(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for DatabaseStorageOptions {
    fn default() -> Self {
        Self {
            connection_string: None,
            table_name: default_table_name(),
            columns: ColumnNames::default(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            id: default_id_column(),
            count: default_count_column(),
            reset: default_reset_column(),
            created_at: default_created_at_column(),
            updated_at: default_updated_at_column(),
        }
    }
}

impl ColumnNames {
    fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("id", self.id.as_str()),
            ("count", self.count.as_str()),
            ("reset", self.reset.as_str()),
            ("createdAt", self.created_at.as_str()),
            ("updatedAt", self.updated_at.as_str()),
        ]
        .into_iter()
    }
}

impl DatabaseStorageOptions {
    /// Configured connection string, falling back to `DATABASE_URL`
    pub fn resolve_connection_string(&self) -> Option<String> {
        self.connection_string
            .clone()
            .or_else(|| std::env::var(DATABASE_URL_ENV).ok())
            .filter(|url| !url.trim().is_empty())
    }

    /// Split the table name into `(schema, table)`, defaulting to `public`
    pub fn qualified_table(&self) -> (String, String) {
        match self.table_name.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => ("public".to_string(), self.table_name.clone()),
        }
    }
}

impl RateLimiterOptions {
    /// Create options for the in-memory backend
    pub fn new(limit: u32, window: u64) -> Self {
        Self {
            limit,
            window,
            storage: StorageConfig::Memory,
            key_prefix: None,
            debug: false,
            on_error: None,
        }
    }

    /// Select a storage backend
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Namespace keys for this limiter
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Install a custom rejection response builder
    pub fn with_on_error(mut self, handler: RejectionHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Get the window as a Duration
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    /// Window length in milliseconds
    pub fn window_millis(&self) -> u64 {
        self.window.saturating_mul(1000)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RateLimiterError::invalid_configuration(
                "Limit must be greater than 0",
            ));
        }

        if self.window == 0 {
            return Err(RateLimiterError::invalid_configuration(
                "Window must be greater than 0",
            ));
        }

        if self.window > MAX_WINDOW_SECS {
            return Err(RateLimiterError::invalid_configuration(format!(
                "Window must be at most {} seconds",
                MAX_WINDOW_SECS
            )));
        }

        match &self.storage {
            StorageConfig::Memory | StorageConfig::Actor => {}
            StorageConfig::Redis(options) => {
                let has_url = options
                    .url
                    .as_deref()
                    .is_some_and(|url| !url.trim().is_empty());
                if !has_url {
                    return Err(RateLimiterError::invalid_configuration(
                        "Redis client is required: set storage.url",
                    ));
                }
                if options.cleanup_interval_secs == 0 {
                    return Err(RateLimiterError::invalid_configuration(
                        "Redis cleanup interval must be greater than 0",
                    ));
                }
            }
            StorageConfig::Postgres(options) => {
                if options.resolve_connection_string().is_none() {
                    return Err(RateLimiterError::database_url_not_found());
                }
                if options.table_name.trim().is_empty() {
                    return Err(RateLimiterError::invalid_configuration(
                        "Database table name cannot be empty",
                    ));
                }
                if let Some((field, _)) = options.columns.iter().find(|(_, c)| c.trim().is_empty())
                {
                    return Err(RateLimiterError::invalid_configuration(format!(
                        "Database column name for '{}' cannot be empty",
                        field
                    )));
                }
                if options.max_connections == 0 {
                    return Err(RateLimiterError::invalid_configuration(
                        "Database max_connections must be greater than 0",
                    ));
                }
            }
        }

        Ok(())
    }
}

impl GateConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RateLimiterError::invalid_configuration(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            RateLimiterError::invalid_configuration(format!("Failed to parse config: {}", e))
        })
    }

    /// Load a config file layered with `RATE_GATE__*` environment overrides
    ///
    /// `RATE_GATE__RATE_LIMIT__LIMIT=20` overrides `rate_limit.limit`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                RateLimiterError::invalid_configuration(format!("Failed to load config: {}", e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_memory_config() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 3000
rate_limit:
  limit: 5
  window: 10
"#;

        let config = GateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.rate_limit.limit, 5);
        assert_eq!(config.rate_limit.window, 10);
        assert_eq!(config.rate_limit.storage, StorageConfig::Memory);
        assert!(!config.rate_limit.debug);
        assert!(config.rate_limit.validate().is_ok());
    }

    #[test]
    fn test_parse_redis_config_defaults() {
        let yaml = r#"
rate_limit:
  limit: 100
  window: 60
  storage:
    type: redis
    url: "redis://localhost:6379"
"#;

        let config = GateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        match &config.rate_limit.storage {
            StorageConfig::Redis(options) => {
                assert_eq!(options.url.as_deref(), Some("redis://localhost:6379"));
                assert_eq!(options.prefix, "ratelimit:");
                assert_eq!(options.cleanup_interval_secs, 60);
            }
            other => panic!("expected redis storage, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_postgres_config() {
        let yaml = r#"
rate_limit:
  limit: 10
  window: 30
  debug: true
  storage:
    type: postgres
    connection_string: "postgres://localhost/limits"
    table_name: "limits.entries"
    columns:
      count: "hits"
"#;

        let config = GateConfig::from_yaml(yaml).unwrap();
        assert!(config.rate_limit.debug);
        let StorageConfig::Postgres(options) = &config.rate_limit.storage else {
            panic!("expected postgres storage");
        };
        assert_eq!(options.columns.count, "hits");
        assert_eq!(options.columns.id, "id");
        assert_eq!(options.columns.updated_at, "updated_at");
        assert_eq!(
            options.qualified_table(),
            ("limits".to_string(), "entries".to_string())
        );
    }

    #[test]
    fn test_unqualified_table_defaults_to_public() {
        let options = DatabaseStorageOptions::default();
        assert_eq!(
            options.qualified_table(),
            ("public".to_string(), "rate_limit_entries".to_string())
        );
    }

    #[test]
    fn test_validate_zero_limit() {
        let err = RateLimiterOptions::new(0, 10).validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_validate_zero_window() {
        let err = RateLimiterOptions::new(5, 0).validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_validate_oversized_window() {
        let err = RateLimiterOptions::new(5, u64::MAX).validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");

        let err = RateLimiterOptions::new(5, MAX_WINDOW_SECS + 1)
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");

        assert!(RateLimiterOptions::new(5, MAX_WINDOW_SECS).validate().is_ok());
    }

    #[test]
    fn test_validate_redis_requires_url() {
        let options = RateLimiterOptions::new(5, 10)
            .with_storage(StorageConfig::Redis(RedisStorageOptions::default()));
        let err = options.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
        assert!(err.to_string().contains("Redis client is required"));
    }

    #[test]
    fn test_validate_postgres_empty_column() {
        let mut db = DatabaseStorageOptions {
            connection_string: Some("postgres://localhost/db".to_string()),
            ..Default::default()
        };
        db.columns.reset = String::new();

        let err = RateLimiterOptions::new(5, 10)
            .with_storage(StorageConfig::Postgres(db))
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
        assert!(err.to_string().contains("'reset'"));
    }

    #[test]
    fn test_validate_postgres_with_connection_string() {
        let db = DatabaseStorageOptions {
            connection_string: Some("postgres://localhost/db".to_string()),
            ..Default::default()
        };
        let options = RateLimiterOptions::new(5, 10).with_storage(StorageConfig::Postgres(db));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_window_conversions() {
        let options = RateLimiterOptions::new(5, 10);
        assert_eq!(options.window_duration(), Duration::from_secs(10));
        assert_eq!(options.window_millis(), 10_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "rate_limit:\n  limit: 3\n  window: 1").unwrap();

        let config = GateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rate_limit.limit, 3);

        let layered = GateConfig::load(file.path()).unwrap();
        assert_eq!(layered.rate_limit.limit, 3);
        assert_eq!(layered.rate_limit.window, 1);
    }

    #[test]
    fn test_from_file_missing() {
        let err = GateConfig::from_file("/nonexistent/rate-gate.yaml").unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
    }
}
