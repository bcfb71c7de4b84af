use super::{RateLimitRecord, Storage};
use crate::clock::Clock;
use crate::config::{ColumnNames, DatabaseStorageOptions};
use crate::error::{RateLimiterError, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Expected shape of one required column
#[derive(Debug, Clone)]
struct RequiredColumn<'a> {
    name: &'a str,
    display_type: &'static str,
    allowable_types: &'static [&'static str],
}

/// A column as reported by `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub udt_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, udt_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            udt_name: udt_name.into(),
        }
    }
}

/// Detected storage types of the rate limit columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTypes {
    pub id: String,
    pub count: String,
    pub reset: String,
    pub created_at: String,
    pub updated_at: String,
}

fn clean_column_type(raw: &str) -> String {
    raw.split('(').next().unwrap_or(raw).trim().to_lowercase()
}

fn is_native_timestamp(udt_name: &str) -> bool {
    matches!(udt_name, "timestamp" | "timestamptz")
}

/// Check reported columns against the required layout
///
/// An empty column list means the table does not exist.
pub fn validate_columns(
    schema: &str,
    table: &str,
    names: &ColumnNames,
    columns: &[ColumnInfo],
) -> Result<ColumnTypes> {
    if columns.is_empty() {
        return Err(RateLimiterError::schema_not_found(schema, table, names));
    }

    let type_map: HashMap<&str, String> = columns
        .iter()
        .map(|c| (c.name.as_str(), clean_column_type(&c.udt_name)))
        .collect();

    let required = [
        RequiredColumn {
            name: &names.id,
            display_type: "VARCHAR(255)",
            allowable_types: &["varchar", "text", "uuid"],
        },
        RequiredColumn {
            name: &names.count,
            display_type: "INTEGER",
            allowable_types: &["int2", "int4", "int8"],
        },
        RequiredColumn {
            name: &names.reset,
            display_type: "INTEGER",
            allowable_types: &["int4", "int8"],
        },
        RequiredColumn {
            name: &names.created_at,
            display_type: "TIMESTAMP",
            allowable_types: &["timestamp", "timestamptz", "varchar", "text"],
        },
        RequiredColumn {
            name: &names.updated_at,
            display_type: "TIMESTAMP",
            allowable_types: &["timestamp", "timestamptz", "varchar", "text"],
        },
    ];

    let mut detected = Vec::with_capacity(required.len());
    for column in &required {
        let Some(actual) = type_map.get(column.name) else {
            return Err(RateLimiterError::invalid_schema(format!(
                "Missing required column: \"{}\". Please add it with type {}",
                column.name, column.display_type
            )));
        };

        if !column.allowable_types.contains(&actual.as_str()) {
            return Err(RateLimiterError::invalid_schema(format!(
                "Invalid type for column \"{}\": expected {}, got {}",
                column.name, column.display_type, actual
            )));
        }

        detected.push(actual.clone());
    }

    let [id, count, reset, created_at, updated_at]: [String; 5] = detected
        .try_into()
        .map_err(|_| RateLimiterError::invalid_schema("Column validation incomplete"))?;

    Ok(ColumnTypes {
        id,
        count,
        reset,
        created_at,
        updated_at,
    })
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQL prepared once the schema has been validated
#[derive(Debug, Clone)]
struct Statements {
    select: String,
    upsert: String,
    delete: String,
    cleanup: String,
}

impl Statements {
    fn build(schema: &str, table: &str, names: &ColumnNames, types: &ColumnTypes) -> Self {
        let table = format!("{}.{}", quote_ident(schema), quote_ident(table));
        let id = quote_ident(&names.id);
        let count = quote_ident(&names.count);
        let reset = quote_ident(&names.reset);
        let created_at = quote_ident(&names.created_at);
        let updated_at = quote_ident(&names.updated_at);

        let key_param = format!("$1::{}", types.id);
        let stamp = |udt_name: &str| {
            if is_native_timestamp(udt_name) {
                "$4::timestamptz"
            } else {
                "$4"
            }
        };

        Self {
            select: format!(
                "SELECT {count}::BIGINT, {reset}::BIGINT FROM {table} \
                 WHERE {id} = {key_param} AND {reset} > $2"
            ),
            upsert: format!(
                "INSERT INTO {table} ({id}, {count}, {reset}, {created_at}, {updated_at}) \
                 VALUES ({key_param}, $2, $3, {created}, {updated}) \
                 ON CONFLICT ({id}) DO UPDATE SET {count} = EXCLUDED.{count}, \
                 {reset} = EXCLUDED.{reset}, {updated_at} = EXCLUDED.{updated_at}",
                created = stamp(&types.created_at),
                updated = stamp(&types.updated_at),
            ),
            delete: format!("DELETE FROM {table} WHERE {id} = {key_param}"),
            cleanup: format!("DELETE FROM {table} WHERE {reset} <= $1"),
        }
    }
}

/// PostgreSQL-backed storage
///
/// The table layout is checked against `information_schema` on first use and
/// the result is cached; until validation succeeds every operation fails with
/// the schema error. `reset` is stored as whole unix seconds, rounded up.
pub struct DatabaseStorage {
    pool: PgPool,
    schema: String,
    table: String,
    columns: ColumnNames,
    clock: Arc<dyn Clock>,
    statements: OnceCell<Statements>,
}

impl DatabaseStorage {
    /// Create a lazily-connecting pool from the configured connection string
    pub fn connect(options: &DatabaseStorageOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        let url = options
            .resolve_connection_string()
            .ok_or_else(RateLimiterError::database_url_not_found)?;

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect_lazy(&url)
            .map_err(RateLimiterError::database_connection)?;

        Ok(Self::from_pool(pool, options, clock))
    }

    /// Use a pool owned by the caller
    pub fn from_pool(pool: PgPool, options: &DatabaseStorageOptions, clock: Arc<dyn Clock>) -> Self {
        let (schema, table) = options.qualified_table();
        Self {
            pool,
            schema,
            table,
            columns: options.columns.clone(),
            clock,
            statements: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.statements.initialized()
    }

    /// Validate the table layout; cached after the first success
    pub async fn initialize(&self) -> Result<()> {
        self.statements().await.map(|_| ())
    }

    async fn statements(&self) -> Result<&Statements> {
        self.statements.get_or_try_init(|| self.probe_schema()).await
    }

    async fn probe_schema(&self) -> Result<Statements> {
        debug!(schema = %self.schema, table = %self.table, "Checking rate limit table schema");

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, udt_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            RateLimiterError::database_connection(format!(
                "Failed to verify database schema. Please ensure you have proper permissions. Error: {}",
                e
            ))
        })?;

        let columns: Vec<ColumnInfo> = rows
            .into_iter()
            .map(|(name, udt_name)| ColumnInfo::new(name, udt_name))
            .collect();
        debug!(?columns, "Detected rate limit table columns");

        let types = validate_columns(&self.schema, &self.table, &self.columns, &columns)?;
        info!(schema = %self.schema, table = %self.table, "Rate limit table schema verified");

        Ok(Statements::build(&self.schema, &self.table, &self.columns, &types))
    }
}

#[async_trait]
impl Storage for DatabaseStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    /// The `reset` column holds whole seconds, so the returned `reset` is the
    /// stored millisecond value rounded up to the next second.
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        let statements = self.statements().await?;
        let now_secs = i64::try_from(self.clock.now_millis() / 1000).unwrap_or(i64::MAX);

        let row: Option<(i64, i64)> = sqlx::query_as(&statements.select)
            .bind(key)
            .bind(now_secs)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(table = %self.table, "Query error: {}", e);
                RateLimiterError::database_connection(
                    "Failed to get rate limit record. Please check your database connection.",
                )
            })?;

        let Some((count, reset_secs)) = row else {
            debug!(key, "No active record found");
            return Ok(None);
        };

        Ok(Some(RateLimitRecord::new(
            u32::try_from(count.max(0)).unwrap_or(u32::MAX),
            (reset_secs.max(0) as u64).saturating_mul(1000),
        )))
    }

    async fn set(&self, key: &str, record: RateLimitRecord) -> Result<()> {
        let reset_secs = i64::try_from(record.reset.div_ceil(1000)).map_err(|_| {
            RateLimiterError::database_connection(format!(
                "Rate limit reset out of range: {}",
                record.reset
            ))
        })?;
        let statements = self.statements().await?;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        sqlx::query(&statements.upsert)
            .bind(key)
            .bind(i64::from(record.count))
            .bind(reset_secs)
            .bind(stamp)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RateLimiterError::database_connection(format!(
                    "Failed to update rate limit record. Error: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let statements = self.statements().await?;

        sqlx::query(&statements.delete)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RateLimiterError::database_connection(format!(
                    "Failed to delete rate limit record. Error: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn cleanup(&self, now: u64) -> Result<()> {
        let statements = self.statements().await?;

        let result = sqlx::query(&statements.cleanup)
            .bind(i64::try_from(now / 1000).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RateLimiterError::database_connection(format!(
                    "Failed to cleanup expired records. Error: {}",
                    e
                ))
            })?;

        debug!(removed = result.rows_affected(), "Expired rate limit rows deleted");
        Ok(())
    }

    async fn destroy(&self) {
        self.pool.close().await;
    }
}
