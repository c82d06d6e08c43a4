// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pooled access to the managed SQLite database.
//!
//! [`StreamDb`] owns a small fixed-size connection pool over the database
//! being replicated, the engine-prefix naming scheme for everything the
//! engine creates inside it, and the table schema cache captured at CDC
//! installation. The capture pipeline, applier, and backup code hang off
//! this type in the sibling modules.
//!
//! # SQLite Busy Handling
//!
//! SQLite returns SQLITE_BUSY/SQLITE_LOCKED under contention. Writes that
//! race the application go through [`execute_with_retry`], which retries
//! with exponential backoff before giving up.

pub mod apply;
pub mod backup;
pub mod change_log;
pub mod schema;

pub use change_log::{ChangeSink, GlobalChangeRow, STATE_FAILED, STATE_PENDING, STATE_PUBLISHED};
pub use schema::{ColumnInfo, TableSchema};

use crate::config::ENGINE_PREFIX;
use crate::error::Result;
use crate::telemetry::Telemetry;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed pool size; one logical operation borrows one connection.
pub const POOL_SIZE: u32 = 4;

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// The managed database plus everything the engine knows about it.
pub struct StreamDb {
    pool: SqlitePool,
    db_path: String,
    prefix: String,
    /// Captured once at CDC installation, read-only afterwards.
    schema_cache: RwLock<HashMap<String, TableSchema>>,
    /// Serializes drain cycles; a drain that finds this held is dropped.
    publish_lock: tokio::sync::Mutex<()>,
    telemetry: Telemetry,
}

impl StreamDb {
    /// Open the database with a WAL-mode pool and force a checkpoint so
    /// the main file reflects all committed state.
    pub async fn open(path: &str, telemetry: Telemetry) -> Result<Self> {
        info!(path = %path, "Opening database");
        let pool = open_pool(path, POOL_SIZE).await?;

        let db = Self {
            pool,
            db_path: path.to_string(),
            prefix: ENGINE_PREFIX.to_string(),
            schema_cache: RwLock::new(HashMap::new()),
            publish_lock: tokio::sync::Mutex::new(()),
            telemetry,
        };
        db.checkpoint().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub(crate) fn publish_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.publish_lock
    }

    /// Cached schema for a watched table.
    pub fn table_schema(&self, table: &str) -> Option<TableSchema> {
        self.schema_cache
            .read()
            .expect("schema cache lock poisoned")
            .get(table)
            .cloned()
    }

    /// Sorted primary-key column names for a watched table.
    pub fn primary_key_columns(&self, table: &str) -> Option<Vec<String>> {
        self.table_schema(table).map(|s| s.sorted_pk_columns())
    }

    /// Tables currently under capture.
    pub fn watched_tables(&self) -> Vec<String> {
        let cache = self.schema_cache.read().expect("schema cache lock poisoned");
        let mut names: Vec<String> = cache.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn cache_schema(&self, table: &str, schema: TableSchema) {
        self.schema_cache
            .write()
            .expect("schema cache lock poisoned")
            .insert(table.to_string(), schema);
    }

    /// Force a WAL checkpoint, waiting out writers holding the log.
    pub async fn checkpoint(&self) -> Result<()> {
        debug!("Forcing WAL checkpoint");
        loop {
            let (busy, log, checkpointed): (i64, i64, i64) =
                sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
                    .fetch_one(&self.pool)
                    .await?;

            if busy == 0 {
                return Ok(());
            }

            debug!(busy, log, checkpointed, "Waiting for checkpoint");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Enumerate replicable user tables: everything that is not SQLite
    /// internal and not engine-owned.
    pub async fn list_user_tables(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM sqlite_schema
            WHERE type = 'table'
              AND name NOT LIKE 'sqlite_%'
              AND name NOT LIKE ?
            ORDER BY name
            "#,
        )
        .bind(format!("{}%", self.prefix))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

/// Open a WAL-mode pool over a database file.
pub(crate) async fn open_pool(path: &str, size: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
        .map_err(|e| crate::error::MarmotError::Config(format!("invalid db path: {}", e)))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(false)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(size)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Open a throwaway single-connection pool over an arbitrary file, used
/// for backup post-processing and restores.
pub(crate) async fn open_single(path: &Path, journal: SqliteJournalMode) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(journal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(false)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Check if an error is a retryable SQLite busy/locked error.
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Quote an identifier for direct inclusion in SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrometheusConfig;
    use tempfile::tempdir;

    pub(crate) fn test_telemetry() -> Telemetry {
        Telemetry::disabled(&PrometheusConfig::default(), 1)
    }

    #[tokio::test]
    async fn test_open_creates_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");
        let db = StreamDb::open(path.to_str().unwrap(), test_telemetry())
            .await
            .unwrap();
        assert_eq!(db.prefix(), "__marmot__");
        assert!(db.list_user_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_user_tables_hides_internal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");
        let db = StreamDb::open(path.to_str().unwrap(), test_telemetry())
            .await
            .unwrap();

        sqlx::query("CREATE TABLE Books(id INTEGER PRIMARY KEY, title TEXT)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE __marmot__Books_change_log(id INTEGER PRIMARY KEY)")
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(db.list_user_tables().await.unwrap(), vec!["Books"]);
    }

    #[tokio::test]
    async fn test_checkpoint_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");
        let db = StreamDb::open(path.to_str().unwrap(), test_telemetry())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t(x INTEGER)")
            .execute(db.pool())
            .await
            .unwrap();
        db.checkpoint().await.unwrap();
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("Books"), "\"Books\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_busy_error_detection() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
