// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applying remote change events to the local database.
//!
//! Apply is idempotent by construction: upserts are `INSERT OR REPLACE`
//! keyed by the table's primary key, deletes are keyed by the primary-key
//! tuple. Each event runs in its own transaction; any database error rolls
//! the whole event back and surfaces to the subscriber's retry policy.

use super::{quote_ident, StreamDb};
use crate::error::{MarmotError, Result};
use crate::event::ChangeEvent;
use crate::value::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use std::collections::BTreeMap;
use tracing::debug;

impl StreamDb {
    /// Apply one decoded change event inside a transaction.
    ///
    /// Unknown tables and events without any primary-key value fail with
    /// `NoTableMapping`; unknown change types fail with
    /// `InvalidOperation`. Both are terminal for the event, not for the
    /// subscriber.
    pub async fn replicate(&self, event: &ChangeEvent) -> Result<()> {
        let pk_map = self.primary_key_map(event)?;

        debug!(
            table = %event.table_name,
            op = %event.op,
            event_id = event.id,
            keys = ?pk_map.keys().collect::<Vec<_>>(),
            "Consuming replication event"
        );

        let mut tx = self.pool().begin().await?;

        if event.is_upsert() {
            let (sql, values) = upsert_statement(event);
            bind_values(sqlx::query(&sql), &values).execute(&mut *tx).await?;
        } else if event.is_delete() {
            let (sql, values) = delete_statement(event, &pk_map);
            bind_values(sqlx::query(&sql), &values).execute(&mut *tx).await?;
        } else {
            return Err(MarmotError::InvalidOperation {
                op: event.op.clone(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// Subset of the event row keyed by the cached schema's primary-key
    /// columns. Empty or unknown-table maps are `NoTableMapping`.
    fn primary_key_map(&self, event: &ChangeEvent) -> Result<BTreeMap<String, Value>> {
        let schema = self
            .table_schema(&event.table_name)
            .ok_or_else(|| MarmotError::NoTableMapping {
                table: event.table_name.clone(),
            })?;

        let mut pk_map = BTreeMap::new();
        for column in schema.columns.iter().filter(|c| c.is_primary_key) {
            if let Some(value) = event.row.get(&column.name) {
                pk_map.insert(column.name.clone(), value.clone());
            }
        }

        if pk_map.is_empty() {
            return Err(MarmotError::NoTableMapping {
                table: event.table_name.clone(),
            });
        }
        Ok(pk_map)
    }
}

/// `INSERT OR REPLACE INTO <table>(<cols>) VALUES (?, …)` over every
/// captured column.
fn upsert_statement(event: &ChangeEvent) -> (String, Vec<Value>) {
    let mut columns = Vec::with_capacity(event.row.len());
    let mut values = Vec::with_capacity(event.row.len());
    for (name, value) in &event.row {
        columns.push(quote_ident(name));
        values.push(value.clone());
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO {}({}) VALUES ({})",
        quote_ident(&event.table_name),
        columns.join(", "),
        placeholders,
    );
    (sql, values)
}

/// `DELETE FROM <table> WHERE pk1 = ? AND pk2 = ? …`.
fn delete_statement(event: &ChangeEvent, pk_map: &BTreeMap<String, Value>) -> (String, Vec<Value>) {
    let mut predicates = Vec::with_capacity(pk_map.len());
    let mut values = Vec::with_capacity(pk_map.len());
    for (name, value) in pk_map {
        predicates.push(format!("{} = ?", quote_ident(name)));
        values.push(value.clone());
    }

    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&event.table_name),
        predicates.join(" AND "),
    );
    (sql, values)
}

/// Bind dynamic values onto a query in order.
fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Blob(v) => query.bind(v.as_slice()),
            Value::Timestamp(ms) => query.bind(*ms),
        };
    }
    query
}
