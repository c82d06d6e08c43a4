// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trigger-based change capture.
//!
//! For every watched table `T` the engine installs:
//!
//! * a shadow table `__marmot__T_change_log` with one `val_<col>` column
//!   per source column plus bookkeeping (`id`, `type`, `state`,
//!   `created_at` in epoch milliseconds),
//! * three `AFTER` triggers (insert/update/delete) that copy the full row
//!   image (`NEW` for insert/update, `OLD` for delete) into the shadow
//!   table and append a reference row to the global index
//!   `__marmot___change_log_global`.
//!
//! Global-index ids are assigned by the database, so draining them in
//! ascending order replays local commit order across all watched tables.
//! Trigger failure rolls back the user's transaction; capture is all or
//! nothing.
//!
//! The drain cycle and the cleanup sweeper live here too; both only ever
//! touch the `state` column and the global index, never user rows.

use super::schema::TableSchema;
use super::{execute_with_retry, now_millis, quote_ident, StreamDb};
use crate::error::{MarmotError, Result};
use crate::event::ChangeEvent;
use crate::value::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Shadow row awaiting publication.
pub const STATE_PENDING: i64 = 0;
/// Shadow row published to the fabric; eligible for garbage collection.
pub const STATE_PUBLISHED: i64 = 1;
/// Reserved failure state; declared for forward compatibility, never
/// assigned by the current pipeline.
pub const STATE_FAILED: i64 = -1;

const TRIGGER_OPS: [(&str, &str); 3] = [("insert", "NEW"), ("update", "NEW"), ("delete", "OLD")];

/// One row of the global change index, in drain order.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalChangeRow {
    pub id: i64,
    pub change_table_id: i64,
    pub table_name: String,
}

/// Where drained change events go.
///
/// The replicator implements this against the fabric; tests implement it
/// with collecting or refusing sinks.
pub trait ChangeSink: Send + Sync {
    fn publish_change(
        &self,
        event: ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

impl StreamDb {
    fn shadow_table(&self, table: &str) -> String {
        format!("{}{}_change_log", self.prefix(), table)
    }

    fn global_table(&self) -> String {
        format!("{}_change_log_global", self.prefix())
    }

    fn trigger_name(&self, table: &str, op: &str) -> String {
        format!("{}on_{}_{}", self.prefix(), op, table)
    }

    /// Install capture on the given tables: cache schemas, create the
    /// global index, shadow tables, and triggers. Idempotent.
    pub async fn install_cdc(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            let name = table.trim();
            if name.is_empty()
                || name.starts_with("sqlite_")
                || name.starts_with(self.prefix())
            {
                return Err(MarmotError::Config(format!(
                    "invalid table to watch {}",
                    table
                )));
            }
            let schema = TableSchema::capture(self.pool(), name).await?;
            if schema.columns.is_empty() {
                return Err(MarmotError::Config(format!("table {} does not exist", name)));
            }
            self.cache_schema(name, schema);
        }

        self.init_global_change_log().await?;
        for table in tables {
            self.init_triggers(table.trim()).await?;
        }
        Ok(())
    }

    async fn init_global_change_log(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {global} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                change_table_id INTEGER NOT NULL,
                table_name TEXT NOT NULL
            )
            "#,
            global = quote_ident(&self.global_table())
        );
        sqlx::raw_sql(&sql).execute(self.pool()).await?;
        Ok(())
    }

    async fn init_triggers(&self, table: &str) -> Result<()> {
        let script = self.table_cdc_script(table)?;
        info!(table = %table, "Creating capture triggers");
        sqlx::raw_sql(&script).execute(self.pool()).await?;
        Ok(())
    }

    /// Full DDL script for one table: shadow table plus the three
    /// triggers. `DROP TRIGGER IF EXISTS` before each `CREATE` keeps
    /// reinstallation idempotent even after a partial failure.
    fn table_cdc_script(&self, table: &str) -> Result<String> {
        let schema = self
            .table_schema(table)
            .ok_or_else(|| MarmotError::Config(format!("table info not found for {}", table)))?;

        let shadow = quote_ident(&self.shadow_table(table));
        let global = quote_ident(&self.global_table());

        let val_defs: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&format!("val_{}", c.name)), c.col_type))
            .collect();
        let val_names: Vec<String> = schema
            .columns
            .iter()
            .map(|c| quote_ident(&format!("val_{}", c.name)))
            .collect();

        let mut script = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {shadow} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                state INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                {val_defs}
            );
            "#,
            shadow = shadow,
            val_defs = val_defs.join(",\n                ")
        );

        for (op, row_ref) in TRIGGER_OPS {
            let trigger = quote_ident(&self.trigger_name(table, op));
            let refs: Vec<String> = schema
                .columns
                .iter()
                .map(|c| format!("{}.{}", row_ref, quote_ident(&c.name)))
                .collect();
            script.push_str(&format!(
                r#"
            DROP TRIGGER IF EXISTS {trigger};
            CREATE TRIGGER IF NOT EXISTS {trigger}
            AFTER {op_upper} ON {table}
            BEGIN
                INSERT INTO {shadow}(type, state, created_at, {val_names})
                VALUES ('{op}', {pending}, CAST(strftime('%s','now') AS INTEGER) * 1000, {refs});
                INSERT INTO {global}(change_table_id, table_name)
                VALUES (last_insert_rowid(), '{table_literal}');
            END;
            "#,
                trigger = trigger,
                op_upper = op.to_uppercase(),
                table = quote_ident(table),
                shadow = shadow,
                val_names = val_names.join(", "),
                op = op,
                pending = STATE_PENDING,
                refs = refs.join(", "),
                global = global,
                table_literal = table.replace('\'', "''"),
            ));
        }

        Ok(script)
    }

    /// Remove every engine trigger and, optionally, every engine table.
    pub async fn remove_cdc(&self, drop_tables: bool) -> Result<()> {
        info!("Uninstalling all capture triggers");
        let triggers: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'trigger' AND name LIKE ?",
        )
        .bind(format!("{}%", self.prefix()))
        .fetch_all(self.pool())
        .await?;

        for (name,) in triggers {
            let sql = format!("DROP TRIGGER IF EXISTS {}", quote_ident(&name));
            sqlx::raw_sql(&sql).execute(self.pool()).await?;
        }

        if drop_tables {
            let tables: Vec<(String,)> = sqlx::query_as(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?",
            )
            .bind(format!("{}%", self.prefix()))
            .fetch_all(self.pool())
            .await?;

            for (name,) in tables {
                let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&name));
                sqlx::raw_sql(&sql).execute(self.pool()).await?;
            }
        }

        Ok(())
    }

    /// Number of global-index rows waiting to be drained.
    pub async fn count_pending_changes(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {}",
            quote_ident(&self.global_table())
        ))
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Up to `limit` global-index rows in ascending id (commit) order.
    pub async fn scan_global_changes(&self, limit: u32) -> Result<Vec<GlobalChangeRow>> {
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(&format!(
            "SELECT id, change_table_id, table_name FROM {} ORDER BY id ASC LIMIT ?",
            quote_ident(&self.global_table())
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, change_table_id, table_name)| GlobalChangeRow {
                id,
                change_table_id,
                table_name,
            })
            .collect())
    }

    /// Materialize the change event a global-index row points at.
    ///
    /// Returns `None` when the referenced shadow row is missing or no
    /// longer pending, which the drain cycle escalates as a fatal
    /// invariant violation.
    async fn fetch_pending_change_event(
        &self,
        change: &GlobalChangeRow,
    ) -> Result<Option<ChangeEvent>> {
        let schema = match self.table_schema(&change.table_name) {
            Some(schema) => schema,
            None => {
                return Err(MarmotError::NoTableMapping {
                    table: change.table_name.clone(),
                })
            }
        };

        let val_cols: Vec<String> = schema
            .columns
            .iter()
            .map(|c| quote_ident(&format!("val_{}", c.name)))
            .collect();
        let sql = format!(
            "SELECT id, type, {vals} FROM {shadow} WHERE id = ? AND state = ?",
            vals = val_cols.join(", "),
            shadow = quote_ident(&self.shadow_table(&change.table_name)),
        );

        let row = sqlx::query(&sql)
            .bind(change.change_table_id)
            .bind(STATE_PENDING)
            .fetch_optional(self.pool())
            .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let id: i64 = row.try_get(0)?;
        let op: String = row.try_get(1)?;

        let mut values = BTreeMap::new();
        for (offset, col) in schema.columns.iter().enumerate() {
            let value = column_value(&row, offset + 2, col.is_time_column())?;
            values.insert(col.name.clone(), value);
        }

        Ok(Some(ChangeEvent {
            id,
            op,
            table_name: change.table_name.clone(),
            row: values,
        }))
    }

    /// Mark a drained change as published: flip the shadow row's state and
    /// delete the global-index row, atomically.
    async fn mark_published(&self, change: &GlobalChangeRow) -> Result<()> {
        let update_sql = format!(
            "UPDATE {} SET state = ? WHERE id = ?",
            quote_ident(&self.shadow_table(&change.table_name))
        );
        let delete_sql = format!(
            "DELETE FROM {} WHERE id = ?",
            quote_ident(&self.global_table())
        );

        let pool = self.pool().clone();
        execute_with_retry("mark_published", || {
            let update_sql = update_sql.clone();
            let delete_sql = delete_sql.clone();
            let pool = pool.clone();
            let change_table_id = change.change_table_id;
            let global_id = change.id;
            async move {
                let mut tx = pool.begin().await?;
                sqlx::query(&update_sql)
                    .bind(STATE_PUBLISHED)
                    .bind(change_table_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&delete_sql)
                    .bind(global_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            }
        })
        .await?;
        Ok(())
    }

    /// One drain cycle: hand pending changes to the sink in commit order,
    /// marking each published on success.
    ///
    /// Serialized by the publish lock; a cycle that finds the lock held is
    /// dropped (the next watcher tick retries). A sink returning
    /// `NotReadyToPublish` or `Canceled` breaks the cycle with the row
    /// left pending; other sink errors skip to the next row.
    pub async fn publish_pending(&self, scan_max: u32, sink: &dyn ChangeSink) -> Result<u64> {
        let _guard = match self.publish_lock().try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Publish in progress, skipping");
                return Ok(0);
            }
        };

        let count_started = Instant::now();
        let pending = self.count_pending_changes().await?;
        self.telemetry().pending_publish(pending.max(0) as u64);
        self.telemetry().count_changes(count_started.elapsed());

        if pending == 0 {
            return Ok(0);
        }

        let scan_started = Instant::now();
        let changes = self.scan_global_changes(scan_max).await?;
        self.telemetry().scan_changes(scan_started.elapsed());

        let mut published = 0u64;
        for change in &changes {
            let event = match self.fetch_pending_change_event(change).await? {
                Some(event) => event,
                None => {
                    // The index references a row that is gone or already
                    // consumed: external tampering or a bug. Stop loudly.
                    error!(
                        table = %change.table_name,
                        change_id = change.change_table_id,
                        "Global change log row not found in corresponding table"
                    );
                    return Err(MarmotError::MissingChangeRow {
                        table: change.table_name.clone(),
                        change_id: change.change_table_id,
                    });
                }
            };

            debug!(
                table = %change.table_name,
                change_id = change.change_table_id,
                op = %event.op,
                "Publishing change"
            );

            match sink.publish_change(event).await {
                Ok(()) => {
                    self.mark_published(change).await?;
                    self.telemetry().published(1);
                    published += 1;
                }
                Err(MarmotError::NotReadyToPublish) | Err(MarmotError::Canceled) => break,
                Err(e) => {
                    error!(
                        table = %change.table_name,
                        change_id = change.change_table_id,
                        error = %e,
                        "Unable to publish change"
                    );
                }
            }
        }

        Ok(published)
    }

    /// Delete published shadow rows older than `before_ms`, across all
    /// watched tables. Pending rows and young rows are never touched.
    pub async fn cleanup_change_logs(&self, before_ms: i64) -> Result<u64> {
        let mut total = 0u64;
        for table in self.watched_tables() {
            let sql = format!(
                "DELETE FROM {} WHERE state = ? AND created_at <= ?",
                quote_ident(&self.shadow_table(&table))
            );
            let result = sqlx::query(&sql)
                .bind(STATE_PUBLISHED)
                .bind(before_ms)
                .execute(self.pool())
                .await?;
            total += result.rows_affected();
        }
        if total > 0 {
            self.telemetry().cleaned_rows(total);
        }
        Ok(total)
    }

    /// Count shadow rows for a table, for diagnostics and tests.
    pub async fn shadow_row_count(&self, table: &str, state: Option<i64>) -> Result<i64> {
        let sql = match state {
            Some(_) => format!(
                "SELECT COUNT(*) FROM {} WHERE state = ?",
                quote_ident(&self.shadow_table(table))
            ),
            None => format!("SELECT COUNT(*) FROM {}", quote_ident(&self.shadow_table(table))),
        };
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        if let Some(state) = state {
            query = query.bind(state);
        }
        let (count,) = query.fetch_one(self.pool()).await?;
        Ok(count)
    }
}

/// Decode one column out of a shadow-row result, coercing declared
/// date/time columns stored as integers into timestamp values.
fn column_value(row: &SqliteRow, idx: usize, is_time: bool) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let type_name = raw.type_info().name().to_uppercase();
    drop(raw);

    let value = match type_name.as_str() {
        "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" | "BOOLEAN" => {
            let v: i64 = row.try_get(idx)?;
            if is_time {
                Value::Timestamp(v)
            } else {
                Value::Integer(v)
            }
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Real(row.try_get(idx)?),
        "TEXT" | "VARCHAR" => Value::Text(row.try_get(idx)?),
        "BLOB" => Value::Blob(row.try_get(idx)?),
        "DATETIME" | "DATE" | "TIMESTAMP" | "TIME" => match row.try_get::<i64, _>(idx) {
            Ok(v) => Value::Timestamp(v),
            Err(_) => Value::Text(row.try_get(idx)?),
        },
        _ => {
            // Dynamically typed column: take whatever decodes first.
            if let Ok(v) = row.try_get::<i64, _>(idx) {
                Value::Integer(v)
            } else if let Ok(v) = row.try_get::<f64, _>(idx) {
                Value::Real(v)
            } else if let Ok(v) = row.try_get::<String, _>(idx) {
                Value::Text(v)
            } else {
                Value::Blob(row.try_get(idx)?)
            }
        }
    };
    Ok(value)
}

/// Sweeper cutoff for a cleanup interval ending now.
pub fn cleanup_cutoff(interval_ms: u64) -> i64 {
    now_millis() - interval_ms as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Telemetry;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Sink that records every event it is offered.
    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeSink for CollectingSink {
        fn publish_change(
            &self,
            event: ChangeEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.events.lock().unwrap().push(event);
            Box::pin(async { Ok(()) })
        }
    }

    /// Sink that always refuses, asking the scanner to retry later.
    struct NotReadySink;

    impl ChangeSink for NotReadySink {
        fn publish_change(
            &self,
            _event: ChangeEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Err(MarmotError::NotReadyToPublish) })
        }
    }

    async fn books_db() -> (tempfile::TempDir, StreamDb) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("books.db");
        let db = StreamDb::open(
            path.to_str().unwrap(),
            Telemetry::disabled(&crate::config::PrometheusConfig::default(), 1),
        )
        .await
        .unwrap();

        sqlx::query(
            "CREATE TABLE Books(
                id INTEGER PRIMARY KEY,
                title TEXT,
                author TEXT,
                publication_year INTEGER
            )",
        )
        .execute(db.pool())
        .await
        .unwrap();

        db.install_cdc(&["Books".to_string()]).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_reserved_tables_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.db");
        let db = StreamDb::open(
            path.to_str().unwrap(),
            Telemetry::disabled(&crate::config::PrometheusConfig::default(), 1),
        )
        .await
        .unwrap();

        assert!(db.install_cdc(&["sqlite_schema".to_string()]).await.is_err());
        assert!(db
            .install_cdc(&["__marmot__x_change_log".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_capture_completeness() {
        let (_dir, db) = books_db().await;

        sqlx::query("INSERT INTO Books(title, author, publication_year) VALUES ('Pride and Prejudice', 'Jane Austen', 1813)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE Books SET publication_year = 1814 WHERE title = 'Pride and Prejudice'")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM Books WHERE title = 'Pride and Prejudice'")
            .execute(db.pool())
            .await
            .unwrap();

        // One global row and one shadow row per statement.
        assert_eq!(db.count_pending_changes().await.unwrap(), 3);
        assert_eq!(db.shadow_row_count("Books", None).await.unwrap(), 3);

        let changes = db.scan_global_changes(100).await.unwrap();
        assert_eq!(changes.len(), 3);
        // Ascending id order is commit order.
        assert!(changes.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_reinstall_is_idempotent() {
        let (_dir, db) = books_db().await;
        db.install_cdc(&["Books".to_string()]).await.unwrap();
        db.install_cdc(&["Books".to_string()]).await.unwrap();

        sqlx::query("INSERT INTO Books(title) VALUES ('Emma')")
            .execute(db.pool())
            .await
            .unwrap();
        // Exactly one capture despite repeated installs.
        assert_eq!(db.count_pending_changes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_publishes_in_order_and_marks_rows() {
        let (_dir, db) = books_db().await;

        for (title, year) in [("Emma", 1815), ("Persuasion", 1817)] {
            sqlx::query("INSERT INTO Books(title, author, publication_year) VALUES (?, 'Jane Austen', ?)")
                .bind(title)
                .bind(year)
                .execute(db.pool())
                .await
                .unwrap();
        }

        let sink = CollectingSink::default();
        let published = db.publish_pending(512, &sink).await.unwrap();
        assert_eq!(published, 2);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, "insert");
        assert_eq!(events[0].table_name, "Books");
        assert_eq!(
            events[0].row.get("title"),
            Some(&Value::Text("Emma".to_string()))
        );
        assert_eq!(
            events[1].row.get("title"),
            Some(&Value::Text("Persuasion".to_string()))
        );
        // Full row image, including the key column.
        assert!(matches!(events[0].row.get("id"), Some(Value::Integer(_))));
        drop(events);

        // Index drained, shadow rows flipped to Published.
        assert_eq!(db.count_pending_changes().await.unwrap(), 0);
        assert_eq!(
            db.shadow_row_count("Books", Some(STATE_PUBLISHED))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            db.shadow_row_count("Books", Some(STATE_PENDING))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_delete_event_carries_old_row() {
        let (_dir, db) = books_db().await;

        sqlx::query("INSERT INTO Books(id, title) VALUES (9, 'Emma')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM Books WHERE id = 9")
            .execute(db.pool())
            .await
            .unwrap();

        let sink = CollectingSink::default();
        db.publish_pending(512, &sink).await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        let delete = &events[1];
        assert_eq!(delete.op, "delete");
        // OLD image: at least every primary-key column.
        assert_eq!(delete.row.get("id"), Some(&Value::Integer(9)));
        assert_eq!(delete.row.get("title"), Some(&Value::Text("Emma".to_string())));
    }

    #[tokio::test]
    async fn test_not_ready_sink_leaves_rows_pending() {
        let (_dir, db) = books_db().await;

        sqlx::query("INSERT INTO Books(title) VALUES ('Emma')")
            .execute(db.pool())
            .await
            .unwrap();

        let published = db.publish_pending(512, &NotReadySink).await.unwrap();
        assert_eq!(published, 0);
        assert_eq!(db.count_pending_changes().await.unwrap(), 1);
        assert_eq!(
            db.shadow_row_count("Books", Some(STATE_PENDING))
                .await
                .unwrap(),
            1
        );

        // The retry path picks the same row up later.
        let sink = CollectingSink::default();
        assert_eq!(db.publish_pending(512, &sink).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_shadow_row_is_fatal() {
        let (_dir, db) = books_db().await;

        sqlx::query("INSERT INTO Books(title) VALUES ('Emma')")
            .execute(db.pool())
            .await
            .unwrap();
        // Tamper: remove the shadow row the index points at.
        sqlx::query("DELETE FROM __marmot__Books_change_log")
            .execute(db.pool())
            .await
            .unwrap();

        let sink = CollectingSink::default();
        let err = db.publish_pending(512, &sink).await.unwrap_err();
        assert!(matches!(err, MarmotError::MissingChangeRow { .. }));
    }

    #[tokio::test]
    async fn test_sweeper_respects_state_and_age() {
        let (_dir, db) = books_db().await;

        sqlx::query("INSERT INTO Books(title) VALUES ('Emma')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO Books(title) VALUES ('Persuasion')")
            .execute(db.pool())
            .await
            .unwrap();

        let sink = CollectingSink::default();
        db.publish_pending(512, &sink).await.unwrap();

        // Rows are Published but young: the sweeper must not touch them.
        let cutoff = now_millis() - 60_000;
        assert_eq!(db.cleanup_change_logs(cutoff).await.unwrap(), 0);

        // Age one row past the cutoff.
        sqlx::query("UPDATE __marmot__Books_change_log SET created_at = created_at - 120000 WHERE id = 1")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(db.cleanup_change_logs(cutoff).await.unwrap(), 1);

        // Second run in quick succession deletes nothing and succeeds.
        assert_eq!(db.cleanup_change_logs(cutoff).await.unwrap(), 0);

        // A pending row past the cutoff survives regardless of age.
        sqlx::query("INSERT INTO Books(title) VALUES ('Mansfield Park')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE __marmot__Books_change_log SET created_at = 0 WHERE state = 0")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(db.cleanup_change_logs(cutoff).await.unwrap(), 0);
        assert_eq!(
            db.shadow_row_count("Books", Some(STATE_PENDING))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_cdc_stops_capture() {
        let (_dir, db) = books_db().await;

        db.remove_cdc(false).await.unwrap();
        sqlx::query("INSERT INTO Books(title) VALUES ('Emma')")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(db.count_pending_changes().await.unwrap(), 0);

        // Shadow tables still present until dropped explicitly.
        assert!(db.shadow_row_count("Books", None).await.is_ok());

        db.remove_cdc(true).await.unwrap();
        assert!(db.shadow_row_count("Books", None).await.is_err());
    }

    #[tokio::test]
    async fn test_rowid_table_capture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rowid.db");
        let db = StreamDb::open(
            path.to_str().unwrap(),
            Telemetry::disabled(&crate::config::PrometheusConfig::default(), 1),
        )
        .await
        .unwrap();

        sqlx::query("CREATE TABLE notes(body TEXT)")
            .execute(db.pool())
            .await
            .unwrap();
        db.install_cdc(&["notes".to_string()]).await.unwrap();

        sqlx::query("INSERT INTO notes(body) VALUES ('remember the milk')")
            .execute(db.pool())
            .await
            .unwrap();

        let sink = CollectingSink::default();
        assert_eq!(db.publish_pending(512, &sink).await.unwrap(), 1);

        let events = sink.events.lock().unwrap();
        // The synthesized key column rides along in the row image.
        assert!(matches!(events[0].row.get("rowid"), Some(Value::Integer(_))));
        assert_eq!(db.primary_key_columns("notes").unwrap(), vec!["rowid"]);
    }

    #[tokio::test]
    async fn test_datetime_columns_become_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dt.db");
        let db = StreamDb::open(
            path.to_str().unwrap(),
            Telemetry::disabled(&crate::config::PrometheusConfig::default(), 1),
        )
        .await
        .unwrap();

        sqlx::query("CREATE TABLE loans(id INTEGER PRIMARY KEY, due_on DATETIME)")
            .execute(db.pool())
            .await
            .unwrap();
        db.install_cdc(&["loans".to_string()]).await.unwrap();

        sqlx::query("INSERT INTO loans(id, due_on) VALUES (1, 1697040000123)")
            .execute(db.pool())
            .await
            .unwrap();

        let sink = CollectingSink::default();
        db.publish_pending(512, &sink).await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(
            events[0].row.get("due_on"),
            Some(&Value::Timestamp(1_697_040_000_123))
        );
    }
}
