// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table schema capture.
//!
//! Column metadata comes from `pragma_table_info` once, at CDC
//! installation, and is cached for the lifetime of the process. Tables
//! without a declared primary key get the database's rowid synthesized as
//! their key column so every watched table stays addressable by a
//! primary-key tuple.

use crate::error::Result;
use sqlx::SqlitePool;

/// One column of a watched table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared SQL type, as written in the schema.
    pub col_type: String,
    pub not_null: bool,
    /// Default literal, as written in the schema.
    pub default_value: Option<String>,
    /// 1-based position within the primary key, 0 when not a key column.
    pub pk_index: i64,
    pub is_primary_key: bool,
}

impl ColumnInfo {
    /// Whether the declared type marks this column as a date/time.
    ///
    /// SQLite has no native timestamp storage class; the declared type is
    /// the only signal that an integer column should replicate as a
    /// timestamp value.
    pub fn is_time_column(&self) -> bool {
        let upper = self.col_type.to_uppercase();
        upper.contains("DATE") || upper.contains("TIME")
    }
}

/// Ordered column list for one watched table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    /// Capture the schema of `table` from the live database.
    pub async fn capture(pool: &SqlitePool, table: &str) -> Result<Self> {
        let rows: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?)"#,
        )
        .bind(table)
        .fetch_all(pool)
        .await?;

        let mut columns: Vec<ColumnInfo> = rows
            .into_iter()
            .map(|(name, col_type, not_null, default_value, pk)| ColumnInfo {
                name,
                col_type,
                not_null: not_null != 0,
                default_value,
                pk_index: pk,
                is_primary_key: pk > 0,
            })
            .collect();

        // No rows at all means the table does not exist; leave the column
        // list empty so callers can reject it.
        if !columns.is_empty() && !columns.iter().any(|c| c.is_primary_key) {
            // No declared key: replicate the database's row identifier.
            columns.push(ColumnInfo {
                name: "rowid".to_string(),
                col_type: "INT".to_string(),
                not_null: true,
                default_value: None,
                pk_index: 1,
                is_primary_key: true,
            });
        }

        Ok(Self {
            table_name: table.to_string(),
            columns,
        })
    }

    /// Primary-key column names sorted lexicographically, the order the
    /// fingerprint hashes them in.
    pub fn sorted_pk_columns(&self) -> Vec<String> {
        let mut pks: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect();
        pks.sort();
        pks
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_pool;
    use tempfile::tempdir;

    async fn pool_with(schema_sql: &str) -> (tempfile::TempDir, SqlitePool) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.db");
        let pool = open_pool(path.to_str().unwrap(), 1).await.unwrap();
        sqlx::query(schema_sql).execute(&pool).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_capture_books_schema() {
        let (_dir, pool) = pool_with(
            "CREATE TABLE Books(
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT,
                publication_year INTEGER DEFAULT 1900
            )",
        )
        .await;

        let schema = TableSchema::capture(&pool, "Books").await.unwrap();
        assert_eq!(schema.table_name, "Books");
        assert_eq!(schema.columns.len(), 4);

        let id = schema.column("id").unwrap();
        assert!(id.is_primary_key);
        assert_eq!(id.pk_index, 1);

        let title = schema.column("title").unwrap();
        assert!(title.not_null);
        assert!(!title.is_primary_key);

        let year = schema.column("publication_year").unwrap();
        assert_eq!(year.default_value.as_deref(), Some("1900"));

        assert_eq!(schema.sorted_pk_columns(), vec!["id"]);
    }

    #[tokio::test]
    async fn test_capture_without_primary_key_synthesizes_rowid() {
        let (_dir, pool) = pool_with("CREATE TABLE notes(body TEXT)").await;

        let schema = TableSchema::capture(&pool, "notes").await.unwrap();
        assert_eq!(schema.columns.len(), 2);

        let rowid = schema.column("rowid").unwrap();
        assert!(rowid.is_primary_key);
        assert!(rowid.not_null);
        assert_eq!(schema.sorted_pk_columns(), vec!["rowid"]);
    }

    #[tokio::test]
    async fn test_composite_key_sorted() {
        let (_dir, pool) = pool_with(
            "CREATE TABLE loans(
                reader_id INTEGER,
                book_id INTEGER,
                due_on DATETIME,
                PRIMARY KEY (reader_id, book_id)
            )",
        )
        .await;

        let schema = TableSchema::capture(&pool, "loans").await.unwrap();
        // Sorted by name, not by key position.
        assert_eq!(schema.sorted_pk_columns(), vec!["book_id", "reader_id"]);
        assert!(schema.column("due_on").unwrap().is_time_column());
        assert!(!schema.column("book_id").unwrap().is_time_column());
    }

    #[test]
    fn test_time_column_detection() {
        let col = |t: &str| ColumnInfo {
            name: "c".to_string(),
            col_type: t.to_string(),
            not_null: false,
            default_value: None,
            pk_index: 0,
            is_primary_key: false,
        };
        assert!(col("DATETIME").is_time_column());
        assert!(col("timestamp").is_time_column());
        assert!(col("DATE").is_time_column());
        assert!(!col("INTEGER").is_time_column());
        assert!(!col("TEXT").is_time_column());
    }
}
