// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log fabric access: sharded durable streams over Redis Streams.
//!
//! Each shard is one stream named `<stream_prefix>-<shard_id>`
//! (`<stream_prefix>-c-<shard_id>` when compression is on). Appends are
//! `XADD` with an approximate `MAXLEN` bound, which gives the discard-old
//! retention policy; reads are cursor-based `XREAD` with a blocking
//! timeout that doubles as the cancellation poll point.
//!
//! # Sequences
//!
//! Stream entry ids are `<ms>-<counter>` pairs. The engine needs a single
//! `u64` per message so the sequence map stays a flat
//! `stream -> last applied sequence` mapping, so entry ids are packed as
//! `ms << 22 | counter`. Packing preserves order; unpacking reconstructs
//! the resume cursor. The counter is masked to 22 bits, far above any
//! per-millisecond append rate a single cluster produces.
//!
//! # Falling behind
//!
//! `oldest_sequence` exposes the first retained entry of a stream. A
//! subscriber whose saved sequence is below it has missed trimmed entries
//! and must restore from a snapshot instead of tailing.

use crate::config::FabricConfig;
use crate::error::{MarmotError, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bits reserved for the per-millisecond counter in a packed sequence.
const SEQ_COUNTER_BITS: u32 = 22;
const SEQ_COUNTER_MASK: u64 = (1 << SEQ_COUNTER_BITS) - 1;

/// Blocking read timeout; also the subscriber's cancellation poll interval.
pub const SUBSCRIBE_BLOCK: Duration = Duration::from_secs(5);

/// Field name carrying the envelope bytes in a stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// One raw message read off a shard stream.
#[derive(Debug, Clone)]
pub struct FabricEntry {
    /// Native stream entry id, used as the in-session read cursor.
    pub entry_id: String,
    /// Packed 64-bit sequence.
    pub sequence: u64,
    /// Envelope bytes (possibly compressed).
    pub payload: Vec<u8>,
}

/// Connect to the fabric with the configured retry budget.
pub async fn connect(cfg: &FabricConfig, node_name: &str) -> Result<ConnectionManager> {
    let url = cfg.primary_url();
    let client = redis::Client::open(url.as_str()).map_err(|e| MarmotError::fabric("open", e))?;

    let mut last_err = None;
    for attempt in 1..=cfg.connect_retries.max(1) {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => {
                info!(url = %url, node = %node_name, attempt, "Connected to log fabric");
                return Ok(conn);
            }
            Err(e) => {
                warn!(
                    attempt,
                    retries = cfg.connect_retries,
                    error = %e,
                    "Fabric connection failed"
                );
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(cfg.reconnect_wait_seconds.max(1))).await;
            }
        }
    }

    Err(match last_err {
        Some(e) => MarmotError::fabric("connect", e),
        None => MarmotError::fabric_msg("connect", "no connection attempts made"),
    })
}

/// Stream name for a shard: `<prefix>[-c]-<shard_id>`.
pub fn stream_name(prefix: &str, compress: bool, shard: u64) -> String {
    if compress {
        format!("{}-c-{}", prefix, shard)
    } else {
        format!("{}-{}", prefix, shard)
    }
}

/// Pack a stream entry id's `(ms, counter)` pair into one order-preserving
/// `u64`.
pub fn pack_sequence(ms: u64, counter: u64) -> u64 {
    (ms << SEQ_COUNTER_BITS) | (counter & SEQ_COUNTER_MASK)
}

/// Unpack a sequence into its `(ms, counter)` pair.
pub fn unpack_sequence(seq: u64) -> (u64, u64) {
    (seq >> SEQ_COUNTER_BITS, seq & SEQ_COUNTER_MASK)
}

/// Parse a native `<ms>-<counter>` entry id into a packed sequence.
pub fn entry_id_to_sequence(entry_id: &str) -> Result<u64> {
    let (ms, counter) = match entry_id.split_once('-') {
        Some((ms, counter)) => {
            let ms: u64 = ms.parse().map_err(|_| {
                MarmotError::fabric_msg("entry-id", format!("bad entry id {}", entry_id))
            })?;
            let counter: u64 = counter.parse().map_err(|_| {
                MarmotError::fabric_msg("entry-id", format!("bad entry id {}", entry_id))
            })?;
            (ms, counter)
        }
        None => (
            entry_id.parse().map_err(|_| {
                MarmotError::fabric_msg("entry-id", format!("bad entry id {}", entry_id))
            })?,
            0,
        ),
    };
    Ok(pack_sequence(ms, counter))
}

/// Render a packed sequence back into the native entry-id cursor form.
/// Sequence 0 renders as `"0"`, the from-the-beginning cursor.
pub fn sequence_to_entry_id(seq: u64) -> String {
    if seq == 0 {
        return "0".to_string();
    }
    let (ms, counter) = unpack_sequence(seq);
    format!("{}-{}", ms, counter)
}

/// Append a payload to a shard stream, bounding retention to `max_entries`.
///
/// Returns the packed sequence of the acknowledged append.
pub async fn publish_entry(
    conn: &mut ConnectionManager,
    stream: &str,
    max_entries: u64,
    payload: &[u8],
) -> Result<u64> {
    let entry_id: String = redis::cmd("XADD")
        .arg(stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(max_entries)
        .arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .query_async(conn)
        .await
        .map_err(|e| MarmotError::fabric("XADD", e))?;

    let seq = entry_id_to_sequence(&entry_id)?;
    debug!(stream = %stream, entry_id = %entry_id, seq, "Published change entry");
    Ok(seq)
}

/// Read entries after `cursor` with a blocking timeout.
///
/// An empty result means the block timed out with nothing new; the caller
/// treats that as its cancellation poll point.
pub async fn read_entries(
    conn: &mut ConnectionManager,
    stream: &str,
    cursor: &str,
    count: usize,
) -> Result<Vec<FabricEntry>> {
    let opts = StreamReadOptions::default()
        .block(SUBSCRIBE_BLOCK.as_millis() as usize)
        .count(count);

    let reply: StreamReadReply = conn
        .xread_options(&[stream], &[cursor], &opts)
        .await
        .map_err(|e| MarmotError::fabric("XREAD", e))?;

    let mut entries = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            let payload = match get_bytes_field(&entry.map, PAYLOAD_FIELD) {
                Ok(p) => p,
                Err(e) => {
                    warn!(
                        stream = %stream,
                        entry_id = %entry.id,
                        error = %e,
                        "Skipping malformed stream entry"
                    );
                    continue;
                }
            };
            entries.push(FabricEntry {
                sequence: entry_id_to_sequence(&entry.id)?,
                entry_id: entry.id,
                payload,
            });
        }
    }

    Ok(entries)
}

/// Packed sequence of the oldest retained entry, `None` when the stream is
/// empty or absent.
pub async fn oldest_sequence(conn: &mut ConnectionManager, stream: &str) -> Result<Option<u64>> {
    let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
        .arg(stream)
        .arg("-")
        .arg("+")
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await
        .map_err(|e| MarmotError::fabric("XRANGE", e))?;

    match result.first() {
        Some((id, _)) => Ok(Some(entry_id_to_sequence(id)?)),
        None => Ok(None),
    }
}

/// Number of retained entries in a stream (0 when absent).
pub async fn stream_len(conn: &mut ConnectionManager, stream: &str) -> Result<u64> {
    let len: u64 = redis::cmd("XLEN")
        .arg(stream)
        .query_async(conn)
        .await
        .map_err(|e| MarmotError::fabric("XLEN", e))?;
    Ok(len)
}

/// Re-apply the retention bound to an existing stream.
///
/// Called at startup when `replication_log.update_existing` is set; the
/// fabric otherwise keeps whatever bound the stream was created with until
/// the next append.
pub async fn trim_stream(
    conn: &mut ConnectionManager,
    stream: &str,
    max_entries: u64,
) -> Result<u64> {
    let trimmed: u64 = redis::cmd("XTRIM")
        .arg(stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(max_entries)
        .query_async(conn)
        .await
        .map_err(|e| MarmotError::fabric("XTRIM", e))?;

    if trimmed > 0 {
        info!(stream = %stream, trimmed, max_entries, "Trimmed stream to retention bound");
    }
    Ok(trimmed)
}

/// Extract a bytes field from a stream entry's field map.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| MarmotError::fabric_msg("entry", format!("missing field {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        other => Err(MarmotError::fabric_msg(
            "entry",
            format!("unexpected type for field {}: {:?}", name, other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        assert_eq!(stream_name("marmot-changes", false, 1), "marmot-changes-1");
        assert_eq!(stream_name("marmot-changes", true, 3), "marmot-changes-c-3");
    }

    #[test]
    fn test_sequence_pack_round_trip() {
        for (ms, counter) in [(0u64, 0u64), (1, 0), (1_697_040_000_123, 0), (42, 4_194_303)] {
            let packed = pack_sequence(ms, counter);
            assert_eq!(unpack_sequence(packed), (ms, counter));
        }
    }

    #[test]
    fn test_sequence_packing_preserves_order() {
        let a = pack_sequence(100, 5);
        let b = pack_sequence(100, 6);
        let c = pack_sequence(101, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_entry_id_to_sequence() {
        let seq = entry_id_to_sequence("1697040000123-7").unwrap();
        assert_eq!(unpack_sequence(seq), (1_697_040_000_123, 7));

        // Bare start marker.
        assert_eq!(entry_id_to_sequence("0").unwrap(), 0);

        assert!(entry_id_to_sequence("not-an-id").is_err());
        assert!(entry_id_to_sequence("").is_err());
    }

    #[test]
    fn test_sequence_to_entry_id() {
        assert_eq!(sequence_to_entry_id(0), "0");

        let seq = pack_sequence(1_697_040_000_123, 7);
        assert_eq!(sequence_to_entry_id(seq), "1697040000123-7");

        // Cursor round trip.
        assert_eq!(entry_id_to_sequence(&sequence_to_entry_id(seq)).unwrap(), seq);
    }

    #[test]
    fn test_get_bytes_field() {
        let mut fields = HashMap::new();
        fields.insert(
            "payload".to_string(),
            redis::Value::BulkString(vec![1, 2, 3]),
        );
        fields.insert("note".to_string(), redis::Value::Int(5));

        assert_eq!(get_bytes_field(&fields, "payload").unwrap(), vec![1, 2, 3]);
        assert!(get_bytes_field(&fields, "missing").is_err());
        assert!(get_bytes_field(&fields, "note").is_err());
    }
}
