// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-stream apply cursors.
//!
//! The sequence map records, for every shard stream, the sequence of the
//! last message this node successfully applied. Subscribers consult it on
//! startup to resume, and on every message to suppress duplicate
//! application after an at-least-once redelivery.
//!
//! # Persistence
//!
//! The whole map is small (one entry per shard stream), so every save
//! rewrites the complete CBOR dump from offset 0 and fsyncs. Entries are
//! never removed and sequences only grow, so the new encoding is never
//! shorter than what it overwrites and no truncation is needed.
//!
//! # Cursor Semantics
//!
//! The map stores the **last successfully applied** sequence. It is written
//! only after an apply commits; a crash between apply and save re-delivers
//! the in-flight message, and the `seq <= saved` check drops it.

use crate::error::{MarmotError, Result};
use minicbor::{Decoder, Encoder};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

struct Inner {
    file: File,
    seq: BTreeMap<String, u64>,
}

/// Persistent `stream name -> last applied sequence` mapping.
///
/// One writer per process; readers and writers serialize on an internal
/// lock.
pub struct SequenceMap {
    inner: Mutex<Inner>,
    path: String,
}

impl SequenceMap {
    /// Open (or create) the sequence map file and load its contents.
    ///
    /// An empty file yields an empty map.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let seq = if raw.is_empty() {
            BTreeMap::new()
        } else {
            decode_map(&raw)?
        };

        if !seq.is_empty() {
            info!(path = %path_str, streams = seq.len(), "Restored sequence map");
        } else {
            debug!(path = %path_str, "Initialized empty sequence map");
        }

        Ok(Self {
            inner: Mutex::new(Inner { file, seq }),
            path: path_str,
        })
    }

    /// Last applied sequence for a stream; 0 when the stream is unknown.
    pub fn get(&self, stream_name: &str) -> u64 {
        let inner = self.inner.lock().expect("sequence map lock poisoned");
        inner.seq.get(stream_name).copied().unwrap_or(0)
    }

    /// Record a successfully applied sequence.
    ///
    /// Monotonic: a save at or below the current value returns the current
    /// value without touching the file. Otherwise the whole map is
    /// rewritten from offset 0 and fsynced before returning.
    pub fn save(&self, stream_name: &str, seq: u64) -> Result<u64> {
        let mut inner = self.inner.lock().expect("sequence map lock poisoned");

        if let Some(&current) = inner.seq.get(stream_name) {
            if seq <= current {
                return Ok(current);
            }
        }

        inner.seq.insert(stream_name.to_string(), seq);
        let encoded = encode_map(&inner.seq)?;

        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&encoded)?;
        inner.file.sync_all()?;

        Ok(seq)
    }

    /// Copy of the full mapping, for diagnostics.
    pub fn all(&self) -> BTreeMap<String, u64> {
        let inner = self.inner.lock().expect("sequence map lock poisoned");
        inner.seq.clone()
    }

    /// File path backing this map.
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn encode_map(seq: &BTreeMap<String, u64>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + seq.len() * 24);
    let mut e = Encoder::new(&mut buf);
    e.map(seq.len() as u64)?;
    for (name, value) in seq {
        e.str(name)?.u64(*value)?;
    }
    Ok(buf)
}

fn decode_map(data: &[u8]) -> Result<BTreeMap<String, u64>> {
    let mut d = Decoder::new(data);
    let len = d
        .map()?
        .ok_or_else(|| MarmotError::from(minicbor::decode::Error::message("indefinite map")))?;
    let mut seq = BTreeMap::new();
    for _ in 0..len {
        let name = d.str()?.to_owned();
        let value = d.u64()?;
        seq.insert(name, value);
    }
    Ok(seq)
}
