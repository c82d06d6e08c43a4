// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events and their shard fingerprint.
//!
//! A [`ChangeEvent`] is the unit of replication: one captured row mutation,
//! carrying the full row image (`NEW` for insert/update, `OLD` for delete)
//! as a column-name → [`Value`] mapping.
//!
//! The [`ChangeEvent::fingerprint`] is a deterministic 64-bit hash of the
//! table name and the primary-key tuple, computed over a canonical CBOR
//! encoding with the key columns sorted by name. Every node derives the
//! same fingerprint for the same logical row, so all events for a row land
//! on the same shard and per-row ordering holds cluster-wide.

use crate::error::Result;
use crate::value::Value;
use minicbor::{Decoder, Encoder};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Change type literal for inserts.
pub const OP_INSERT: &str = "insert";
/// Change type literal for updates.
pub const OP_UPDATE: &str = "update";
/// Change type literal for deletes.
pub const OP_DELETE: &str = "delete";

/// One captured row mutation.
///
/// The change type is carried as a string on the wire; validation happens
/// at apply time so an unknown type from a newer peer degrades to a logged
/// `InvalidOperation` instead of a decode failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Row id in the per-table shadow log (monotonic per table).
    pub id: i64,
    /// `insert`, `update` or `delete`.
    pub op: String,
    /// The watched table this change belongs to.
    pub table_name: String,
    /// Column name → value for every captured column.
    pub row: BTreeMap<String, Value>,
}

impl ChangeEvent {
    pub fn new(id: i64, op: &str, table_name: &str, row: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            op: op.to_string(),
            table_name: table_name.to_string(),
            row,
        }
    }

    /// Whether this change applies as an insert-or-replace.
    pub fn is_upsert(&self) -> bool {
        self.op == OP_INSERT || self.op == OP_UPDATE
    }

    /// Whether this change applies as a delete.
    pub fn is_delete(&self) -> bool {
        self.op == OP_DELETE
    }

    /// Encode onto an in-flight CBOR stream as a string-keyed map.
    ///
    /// String keys keep the format self-describing: old peers skip fields
    /// they do not know.
    pub fn encode(&self, e: &mut Encoder<&mut Vec<u8>>) -> Result<()> {
        e.map(4)?;
        e.str("id")?.i64(self.id)?;
        e.str("type")?.str(&self.op)?;
        e.str("table_name")?.str(&self.table_name)?;
        e.str("row")?;
        e.map(self.row.len() as u64)?;
        for (name, value) in &self.row {
            e.str(name)?;
            value.encode(e)?;
        }
        Ok(())
    }

    /// Decode one event from a CBOR stream, skipping unknown map keys.
    pub fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let mut id = 0i64;
        let mut op = String::new();
        let mut table_name = String::new();
        let mut row = BTreeMap::new();

        let len = map_len(d)?;
        for _ in 0..len {
            let key = d.str()?.to_owned();
            match key.as_str() {
                "id" => id = i64::try_from(d.int()?).unwrap_or_default(),
                "type" => op = d.str()?.to_owned(),
                "table_name" => table_name = d.str()?.to_owned(),
                "row" => {
                    let row_len = map_len(d)?;
                    for _ in 0..row_len {
                        let col = d.str()?.to_owned();
                        let value = Value::decode(d)?;
                        row.insert(col, value);
                    }
                }
                _ => d.skip()?,
            }
        }

        Ok(Self {
            id,
            op,
            table_name,
            row,
        })
    }

    /// Deterministic 64-bit fingerprint of `(table_name, sorted PK tuple)`.
    ///
    /// `pk_columns` is the primary-key column set from the cached table
    /// schema; it is sorted here so that nodes with different column
    /// declaration order agree. A key column missing from the row hashes
    /// as null rather than failing, which keeps the fingerprint total.
    pub fn fingerprint(&self, pk_columns: &[String]) -> Result<u64> {
        let mut sorted: Vec<&String> = pk_columns.iter().collect();
        sorted.sort();

        let mut buf = Vec::with_capacity(64);
        let mut e = Encoder::new(&mut buf);
        e.begin_array()?;
        e.str(&self.table_name)?;
        for pk in sorted {
            e.array(2)?;
            e.str(pk)?;
            match self.row.get(pk) {
                Some(value) => value.encode(&mut e)?,
                None => {
                    e.null()?;
                }
            }
        }
        e.end()?;

        Ok(fingerprint_bytes(&buf))
    }
}

/// Definite map header length. The engine always encodes definite maps;
/// indefinite maps from foreign encoders are rejected.
pub(crate) fn map_len(d: &mut Decoder<'_>) -> Result<u64> {
    match d.map()? {
        Some(n) => Ok(n),
        None => Err(minicbor::decode::Error::message("indefinite map not supported").into()),
    }
}

/// 64-bit digest of a byte string: the first eight bytes of its SHA-256,
/// big-endian. Shared by the shard fingerprint, the snapshot content tag,
/// and the derived node identity.
pub fn fingerprint_bytes(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn books_event(id_value: i64) -> ChangeEvent {
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), Value::Integer(id_value));
        row.insert(
            "title".to_string(),
            Value::Text("Pride and Prejudice".to_string()),
        );
        row.insert("author".to_string(), Value::Text("Jane Austen".to_string()));
        row.insert("publication_year".to_string(), Value::Integer(1813));
        ChangeEvent::new(1, OP_INSERT, "Books", row)
    }

    #[test]
    fn test_op_predicates() {
        assert!(books_event(3).is_upsert());
        assert!(!books_event(3).is_delete());

        let mut ev = books_event(3);
        ev.op = OP_DELETE.to_string();
        assert!(ev.is_delete());
        assert!(!ev.is_upsert());

        ev.op = "vacuum".to_string();
        assert!(!ev.is_upsert());
        assert!(!ev.is_delete());
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let pk = vec!["id".to_string()];
        let a = books_event(3).fingerprint(&pk).unwrap();
        let b = books_event(3).fingerprint(&pk).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_ignores_pk_declaration_order() {
        let mut row = BTreeMap::new();
        row.insert("a".to_string(), Value::Integer(1));
        row.insert("b".to_string(), Value::Integer(2));
        let ev = ChangeEvent::new(1, OP_INSERT, "pairs", row);

        let forward = ev
            .fingerprint(&["a".to_string(), "b".to_string()])
            .unwrap();
        let reversed = ev
            .fingerprint(&["b".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_fingerprint_ignores_non_key_columns() {
        let pk = vec!["id".to_string()];
        let original = books_event(3).fingerprint(&pk).unwrap();

        let mut updated = books_event(3);
        updated
            .row
            .insert("title".to_string(), Value::Text("Emma".to_string()));
        updated.op = OP_UPDATE.to_string();
        assert_eq!(updated.fingerprint(&pk).unwrap(), original);
    }

    #[test]
    fn test_fingerprint_differs_per_key_and_table() {
        let pk = vec!["id".to_string()];
        let three = books_event(3).fingerprint(&pk).unwrap();
        let four = books_event(4).fingerprint(&pk).unwrap();
        assert_ne!(three, four);

        let mut other_table = books_event(3);
        other_table.table_name = "Authors".to_string();
        assert_ne!(other_table.fingerprint(&pk).unwrap(), three);
    }

    #[test]
    fn test_fingerprint_missing_key_column_hashes_null() {
        let mut row = BTreeMap::new();
        row.insert("title".to_string(), Value::Text("orphan".to_string()));
        let ev = ChangeEvent::new(1, OP_INSERT, "Books", row);
        // Must not fail; the missing key digests as null.
        let pk = vec!["id".to_string()];
        let fp = ev.fingerprint(&pk).unwrap();
        assert_ne!(fp, books_event(3).fingerprint(&pk).unwrap());
    }

    #[test]
    fn test_shard_selection_stable() {
        // An eight-shard cluster routes the same key to the same shard on
        // every run and every node.
        let pk = vec!["id".to_string()];
        let fp = books_event(3).fingerprint(&pk).unwrap();
        let shard = (fp % 8) + 1;
        assert!((1..=8).contains(&shard));
        assert_eq!(shard, (books_event(3).fingerprint(&pk).unwrap() % 8) + 1);
    }

    #[test]
    fn test_codec_round_trip() {
        let ev = books_event(3);
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        ev.encode(&mut e).unwrap();

        let mut d = Decoder::new(&buf);
        assert_eq!(ChangeEvent::decode(&mut d).unwrap(), ev);
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        // A newer peer may append fields; old readers skip them.
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(5).unwrap();
        e.str("id").unwrap().i64(9).unwrap();
        e.str("type").unwrap().str("delete").unwrap();
        e.str("table_name").unwrap().str("Books").unwrap();
        e.str("row").unwrap().map(1).unwrap();
        e.str("id").unwrap().i64(9).unwrap();
        e.str("future_field").unwrap().str("ignored").unwrap();

        let mut d = Decoder::new(&buf);
        let ev = ChangeEvent::decode(&mut d).unwrap();
        assert_eq!(ev.id, 9);
        assert_eq!(ev.op, OP_DELETE);
        assert_eq!(ev.row.get("id"), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_fingerprint_bytes_known_width() {
        let a = fingerprint_bytes(b"marmot");
        let b = fingerprint_bytes(b"marmot");
        let c = fingerprint_bytes(b"groundhog");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
