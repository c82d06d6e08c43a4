// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire codec for replication envelopes.
//!
//! Every message on a shard stream is the CBOR encoding of a
//! [`ReplicationEnvelope`]: the originating node id plus one
//! [`ChangeEvent`]. String-keyed maps keep the format self-describing so
//! optional fields can be added without breaking older peers.
//!
//! Payloads are optionally zstd-compressed. The read path sniffs the zstd
//! magic bytes, so compressed and raw producers can share a cluster during
//! a configuration rollout.

use crate::error::{MarmotError, Result};
use crate::event::{map_len, ChangeEvent};
use minicbor::{Decoder, Encoder};
use std::io::Read;

/// zstd frame magic, used to detect compressed payloads.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd compression level for published payloads.
const ZSTD_LEVEL: i32 = 3;

/// A change event stamped with its origin node.
///
/// The origin id drives loop suppression: a subscriber drops every message
/// whose `from_node_id` equals its own node id.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationEnvelope {
    pub from_node_id: u64,
    pub payload: ChangeEvent,
}

impl ReplicationEnvelope {
    pub fn new(from_node_id: u64, payload: ChangeEvent) -> Self {
        Self {
            from_node_id,
            payload,
        }
    }

    /// Encode to CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        let mut e = Encoder::new(&mut buf);
        e.map(2)?;
        e.str("from_node_id")?.u64(self.from_node_id)?;
        e.str("payload")?;
        self.payload.encode(&mut e)?;
        Ok(buf)
    }

    /// Decode from CBOR bytes, skipping unknown fields.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(data);
        let mut from_node_id = 0u64;
        let mut payload = None;

        let len = map_len(&mut d)?;
        for _ in 0..len {
            let key = d.str()?.to_owned();
            match key.as_str() {
                "from_node_id" => from_node_id = d.u64()?,
                "payload" => payload = Some(ChangeEvent::decode(&mut d)?),
                _ => d.skip()?,
            }
        }

        let payload = payload.ok_or_else(|| {
            MarmotError::from(minicbor::decode::Error::message("envelope missing payload"))
        })?;

        Ok(Self {
            from_node_id,
            payload,
        })
    }
}

/// Compress a payload for publication.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, ZSTD_LEVEL)
        .map_err(|e| MarmotError::Decompression(format!("zstd encode: {}", e)))
}

/// Decompress zstd data if it carries the magic header, otherwise return
/// it untouched.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| MarmotError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| MarmotError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
