// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication semantics across two real databases.
//!
//! Simulates the wire: changes captured on a writer node are encoded into
//! envelopes, carried as bytes, and applied on a reader node following
//! the subscriber protocol (sequence check, loop suppression, apply,
//! cursor save). No fabric server is involved.

use marmot::codec::{compress, maybe_decompress, ReplicationEnvelope};
use marmot::config::PrometheusConfig;
use marmot::db::{ChangeSink, StreamDb};
use marmot::error::Result;
use marmot::event::ChangeEvent;
use marmot::seq_map::SequenceMap;
use marmot::telemetry::Telemetry;
use marmot::value::Value;
use std::future::Future;
use std::pin::Pin;
use std::path::Path;
use std::sync::Mutex;

const NODE_A: u64 = 1;
const NODE_B: u64 = 2;

const BOOKS_SCHEMA: &str = "CREATE TABLE Books(
    id INTEGER PRIMARY KEY,
    title TEXT,
    author TEXT,
    publication_year INTEGER
)";

/// Sink that encodes events into wire envelopes, like the publisher does.
struct WireSink {
    node_id: u64,
    compress: bool,
    messages: Mutex<Vec<Vec<u8>>>,
}

impl WireSink {
    fn new(node_id: u64, compressed: bool) -> Self {
        Self {
            node_id,
            compress: compressed,
            messages: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }
}

impl ChangeSink for WireSink {
    fn publish_change(
        &self,
        event: ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let envelope = ReplicationEnvelope::new(self.node_id, event);
        Box::pin(async move {
            let mut payload = envelope.encode()?;
            if self.compress {
                payload = compress(&payload)?;
            }
            self.messages.lock().unwrap().push(payload);
            Ok(())
        })
    }
}

async fn node(dir: &Path, name: &str, node_id: u64) -> StreamDb {
    let db = StreamDb::open(
        dir.join(name).to_str().unwrap(),
        Telemetry::disabled(&PrometheusConfig::default(), node_id),
    )
    .await
    .unwrap();
    sqlx::query(BOOKS_SCHEMA).execute(db.pool()).await.unwrap();
    db.install_cdc(&["Books".to_string()]).await.unwrap();
    db
}

async fn book_count(db: &StreamDb, title: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM Books WHERE title = ?")
        .bind(title)
        .fetch_one(db.pool())
        .await
        .unwrap();
    count
}

/// Run the subscriber's apply protocol for one delivered message.
async fn deliver(
    db: &StreamDb,
    seq_map: &SequenceMap,
    self_node: u64,
    stream: &str,
    sequence: u64,
    payload: &[u8],
) -> bool {
    if sequence <= seq_map.get(stream) {
        return false;
    }
    let raw = maybe_decompress(payload).unwrap();
    let envelope = ReplicationEnvelope::decode(&raw).unwrap();
    if envelope.from_node_id == self_node {
        seq_map.save(stream, sequence).unwrap();
        return false;
    }
    db.replicate(&envelope.payload).await.unwrap();
    seq_map.save(stream, sequence).unwrap();
    true
}

#[tokio::test]
async fn single_insert_replicates_between_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let writer = node(dir.path(), "a.db", NODE_A).await;
    let reader = node(dir.path(), "b.db", NODE_B).await;
    let seq_map = SequenceMap::open(dir.path().join("b-seq.cbor")).unwrap();

    sqlx::query(
        "INSERT INTO Books(title, author, publication_year)
         VALUES ('Pride and Prejudice', 'Jane Austen', 1813)",
    )
    .execute(writer.pool())
    .await
    .unwrap();

    let sink = WireSink::new(NODE_A, false);
    writer.publish_pending(512, &sink).await.unwrap();
    let messages = sink.take();
    assert_eq!(messages.len(), 1);

    let applied = deliver(&reader, &seq_map, NODE_B, "marmot-changes-1", 1, &messages[0]).await;
    assert!(applied);
    assert_eq!(book_count(&reader, "Pride and Prejudice").await, 1);

    // The writer's own copy is unchanged by its capture.
    assert_eq!(book_count(&writer, "Pride and Prejudice").await, 1);
}

#[tokio::test]
async fn full_statement_mix_converges() {
    let dir = tempfile::tempdir().unwrap();
    let writer = node(dir.path(), "a.db", NODE_A).await;
    let reader = node(dir.path(), "b.db", NODE_B).await;
    let seq_map = SequenceMap::open(dir.path().join("b-seq.cbor")).unwrap();

    sqlx::query("INSERT INTO Books(id, title, publication_year) VALUES (1, 'Emma', 1815)")
        .execute(writer.pool())
        .await
        .unwrap();
    sqlx::query("INSERT INTO Books(id, title, publication_year) VALUES (2, 'Persuasion', 1817)")
        .execute(writer.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE Books SET publication_year = 1816 WHERE id = 1")
        .execute(writer.pool())
        .await
        .unwrap();
    sqlx::query("DELETE FROM Books WHERE id = 2")
        .execute(writer.pool())
        .await
        .unwrap();

    let sink = WireSink::new(NODE_A, true);
    writer.publish_pending(512, &sink).await.unwrap();
    let messages = sink.take();
    assert_eq!(messages.len(), 4);

    for (i, message) in messages.iter().enumerate() {
        deliver(
            &reader,
            &seq_map,
            NODE_B,
            "marmot-changes-c-1",
            (i + 1) as u64,
            message,
        )
        .await;
    }

    // Converged: Emma updated, Persuasion gone.
    let (year,): (i64,) = sqlx::query_as("SELECT publication_year FROM Books WHERE id = 1")
        .fetch_one(reader.pool())
        .await
        .unwrap();
    assert_eq!(year, 1816);
    assert_eq!(book_count(&reader, "Persuasion").await, 0);
}

#[tokio::test]
async fn self_originated_messages_are_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let db = node(dir.path(), "self.db", NODE_A).await;
    let seq_map = SequenceMap::open(dir.path().join("seq.cbor")).unwrap();

    // Shadow table clean before delivery.
    assert_eq!(db.shadow_row_count("Books", None).await.unwrap(), 0);

    let mut row = std::collections::BTreeMap::new();
    row.insert("id".to_string(), Value::Integer(3));
    row.insert("title".to_string(), Value::Text("echo".to_string()));
    let payload = ReplicationEnvelope::new(NODE_A, ChangeEvent::new(1, "insert", "Books", row))
        .encode()
        .unwrap();

    let applied = deliver(&db, &seq_map, NODE_A, "marmot-changes-1", 7, &payload).await;
    assert!(!applied);

    // Acknowledged, but nothing was written: no user row, shadow table
    // still empty after the message.
    assert_eq!(book_count(&db, "echo").await, 0);
    assert_eq!(db.shadow_row_count("Books", None).await.unwrap(), 0);
    assert_eq!(seq_map.get("marmot-changes-1"), 7);
}

#[tokio::test]
async fn duplicate_delivery_after_restart_applies_once() {
    let dir = tempfile::tempdir().unwrap();
    let reader = node(dir.path(), "b.db", NODE_B).await;
    let seq_path = dir.path().join("seq.cbor");

    // Crash-restart boundary: the cursor says 42 was applied.
    {
        let seq_map = SequenceMap::open(&seq_path).unwrap();
        seq_map.save("marmot-changes-1", 42).unwrap();
    }
    let seq_map = SequenceMap::open(&seq_path).unwrap();

    let make = |id: i64, title: &str| {
        let mut row = std::collections::BTreeMap::new();
        row.insert("id".to_string(), Value::Integer(id));
        row.insert("title".to_string(), Value::Text(title.to_string()));
        ReplicationEnvelope::new(NODE_A, ChangeEvent::new(id, "insert", "Books", row))
            .encode()
            .unwrap()
    };

    // Redelivered 42 and fresh 43.
    let applied_42 = deliver(&reader, &seq_map, NODE_B, "marmot-changes-1", 42, &make(1, "old")).await;
    let applied_43 = deliver(&reader, &seq_map, NODE_B, "marmot-changes-1", 43, &make(2, "new")).await;

    assert!(!applied_42);
    assert!(applied_43);
    assert_eq!(book_count(&reader, "old").await, 0);
    assert_eq!(book_count(&reader, "new").await, 1);
    assert_eq!(seq_map.get("marmot-changes-1"), 43);
}

#[tokio::test]
async fn replicated_applies_are_recaptured_for_other_shards() {
    // A change applied from a peer lands through normal SQL, so local
    // triggers capture it again; loop suppression on the peers (not the
    // capture layer) is what stops the cycle.
    let dir = tempfile::tempdir().unwrap();
    let reader = node(dir.path(), "b.db", NODE_B).await;
    let seq_map = SequenceMap::open(dir.path().join("seq.cbor")).unwrap();

    let mut row = std::collections::BTreeMap::new();
    row.insert("id".to_string(), Value::Integer(3));
    row.insert("title".to_string(), Value::Text("ripple".to_string()));
    let payload = ReplicationEnvelope::new(NODE_A, ChangeEvent::new(1, "insert", "Books", row))
        .encode()
        .unwrap();

    deliver(&reader, &seq_map, NODE_B, "marmot-changes-1", 1, &payload).await;
    assert_eq!(reader.shadow_row_count("Books", None).await.unwrap(), 1);
}
