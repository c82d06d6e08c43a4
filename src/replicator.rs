// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard router, publisher, and per-shard subscriber loops.
//!
//! # Publishing
//!
//! A change event's fingerprint selects its shard
//! (`shard = fingerprint % N + 1`), so all events for one row always ride
//! the same stream and per-row order holds cluster-wide. Payloads are
//! optionally zstd-compressed; compressed clusters use the `-c` stream
//! name variant. Every `max_entries / N` appends on the snapshot shard
//! (shard 1) kick off an asynchronous, lease-guarded snapshot save.
//!
//! # Subscribing
//!
//! One loop per shard. Delivery is at-least-once; apply is at-most-once:
//! a message whose sequence is at or below the stream's saved cursor is
//! skipped, self-originated messages are acknowledged without applying,
//! and the sequence map is written only after an apply commits. Apply
//! runs under a bounded retry budget; exhaustion propagates to the
//! orchestrator's error channel and terminates the process.

use crate::codec::{self, ReplicationEnvelope};
use crate::config::Config;
use crate::db::StreamDb;
use crate::error::{MarmotError, Result};
use crate::fabric::{self, FabricEntry};
use crate::lease::LeaseStore;
use crate::resilience::{retry_async, RetryConfig};
use crate::seq_map::SequenceMap;
use crate::snapshot::{SnapshotEngine, SnapshotStorage};
use crate::telemetry::Telemetry;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// The shard whose append count paces snapshot saves.
const SNAPSHOT_SHARD: u64 = 1;

/// Entries fetched per blocking read.
const READ_BATCH: usize = 100;

/// What happened to one delivered message at the apply boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied and acknowledged.
    Applied,
    /// Sequence at or below the saved cursor; already applied.
    Duplicate,
    /// Originated here; acknowledged without applying.
    SelfOrigin,
    /// Replication disabled on this node; acknowledged without applying.
    Disabled,
    /// Terminal for the event (unknown table / operation); acknowledged
    /// so the stream does not poison.
    AckedError,
}

/// Fabric-side replication: stream setup, publishing, and subscription.
pub struct Replicator {
    node_id: u64,
    shards: u64,
    compress: bool,
    entries_per_shard: u64,
    stream_prefix: String,
    snapshot_enabled: bool,
    conn: ConnectionManager,
    seq_map: Arc<SequenceMap>,
    snapshot: Arc<SnapshotEngine>,
    snapshot_publish_count: AtomicU64,
    last_snapshot: Arc<Mutex<Option<Instant>>>,
    telemetry: Telemetry,
}

impl Replicator {
    /// Wire the replicator: open the sequence map, build the lease store
    /// and snapshot engine, and bring per-shard streams in line with the
    /// configured retention.
    pub async fn new(
        cfg: &Config,
        conn: ConnectionManager,
        db: Arc<StreamDb>,
        storage: Arc<dyn SnapshotStorage>,
        telemetry: Telemetry,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let seq_map = Arc::new(SequenceMap::open(&cfg.seq_map_path)?);
        let lease = LeaseStore::new(conn.clone(), &cfg.fabric.stream_prefix, cfg.node_id);
        let snapshot = Arc::new(SnapshotEngine::new(db, storage, lease, shutdown));

        let replicator = Self {
            node_id: cfg.node_id,
            shards: cfg.replication_log.shards,
            compress: cfg.replication_log.compress,
            entries_per_shard: cfg.replication_log.entries_per_shard(),
            stream_prefix: cfg.fabric.stream_prefix.clone(),
            snapshot_enabled: cfg.snapshot.enabled,
            conn,
            seq_map,
            snapshot,
            snapshot_publish_count: AtomicU64::new(0),
            last_snapshot: Arc::new(Mutex::new(None)),
            telemetry,
        };

        replicator
            .init_streams(cfg.replication_log.update_existing)
            .await?;
        Ok(replicator)
    }

    /// Per-shard stream setup. With `update_existing` the retention bound
    /// is re-applied to streams that already exist; otherwise divergence
    /// is logged and left alone.
    async fn init_streams(&self, update_existing: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        for shard in 1..=self.shards {
            let stream = self.stream_name(shard);
            let len = fabric::stream_len(&mut conn, &stream).await?;
            info!(
                stream = %stream,
                entries = len,
                max_entries = self.entries_per_shard,
                "Stream info"
            );
            if update_existing && len > self.entries_per_shard {
                fabric::trim_stream(&mut conn, &stream, self.entries_per_shard).await?;
            } else if len > self.entries_per_shard {
                warn!(
                    stream = %stream,
                    entries = len,
                    max_entries = self.entries_per_shard,
                    "Existing stream exceeds configured retention, leaving as-is"
                );
            }
        }
        Ok(())
    }

    /// Stream name for a shard under the current compression mode.
    pub fn stream_name(&self, shard: u64) -> String {
        fabric::stream_name(&self.stream_prefix, self.compress, shard)
    }

    /// `shard = fingerprint % N + 1`.
    pub fn shard_for(&self, fingerprint: u64) -> u64 {
        (fingerprint % self.shards) + 1
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn shards(&self) -> u64 {
        self.shards
    }

    pub fn sequence_map(&self) -> &Arc<SequenceMap> {
        &self.seq_map
    }

    /// Append an encoded envelope to the shard its fingerprint selects.
    ///
    /// Returns the acknowledged sequence. On the snapshot shard, every
    /// `max_entries / N`th append schedules an asynchronous snapshot
    /// save, serialized cluster-wide by the snapshot lease.
    pub async fn publish(&self, fingerprint: u64, payload: Vec<u8>) -> Result<u64> {
        let shard = self.shard_for(fingerprint);
        let stream = self.stream_name(shard);

        let payload = if self.compress {
            codec::compress(&payload)?
        } else {
            payload
        };

        let mut conn = self.conn.clone();
        let seq =
            fabric::publish_entry(&mut conn, &stream, self.entries_per_shard, &payload).await?;
        debug!(stream = %stream, seq, "Published");

        if self.snapshot_enabled && shard == SNAPSHOT_SHARD && self.entries_per_shard > 0 {
            let count = self.snapshot_publish_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count % self.entries_per_shard == 0 {
                self.spawn_snapshot_save();
            }
        }

        Ok(seq)
    }

    fn spawn_snapshot_save(&self) {
        let snapshot = Arc::clone(&self.snapshot);
        let last_snapshot = Arc::clone(&self.last_snapshot);
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            match snapshot.save().await {
                Ok(true) => {
                    *last_snapshot.lock().expect("snapshot clock poisoned") =
                        Some(Instant::now());
                    telemetry.snapshot_saved();
                }
                Ok(false) => {}
                Err(MarmotError::PendingSnapshot) => {
                    debug!("Snapshot already in progress, skipping scheduled save");
                }
                Err(e) => warn!(error = %e, "Scheduled snapshot save failed"),
            }
        });
    }

    /// Take and upload a snapshot now, waiting for completion.
    pub async fn save_snapshot(&self) -> Result<bool> {
        let saved = self.snapshot.save().await?;
        if saved {
            *self.last_snapshot.lock().expect("snapshot clock poisoned") = Some(Instant::now());
            self.telemetry.snapshot_saved();
        }
        Ok(saved)
    }

    /// When the last successful save on this node finished.
    pub fn last_save_snapshot_time(&self) -> Option<Instant> {
        *self.last_snapshot.lock().expect("snapshot clock poisoned")
    }

    /// Restore from the stored snapshot if any shard cursor has fallen
    /// behind its stream's retained window.
    ///
    /// The sequence map is not rewound: subscribers skip forward past the
    /// restored state on their next iteration.
    pub async fn restore_snapshot(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        for shard in 1..=self.shards {
            let stream = self.stream_name(shard);
            if let Some(oldest) = fabric::oldest_sequence(&mut conn, &stream).await? {
                let saved = self.seq_map.get(&stream);
                if saved < oldest {
                    info!(
                        shard,
                        stream = %stream,
                        saved,
                        oldest,
                        "Cursor behind retained window, restoring snapshot"
                    );
                    return self.snapshot.restore().await;
                }
            }
        }
        debug!("All shard cursors within retained windows");
        Ok(())
    }

    /// Per-shard subscriber loop. Runs until shutdown or a terminal apply
    /// failure; the latter is the caller's signal to exit non-zero.
    pub async fn listen(
        &self,
        shard: u64,
        db: Arc<StreamDb>,
        replicate: bool,
        pulse: mpsc::UnboundedSender<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let stream = self.stream_name(shard);
        let mut conn = self.conn.clone();
        let mut cursor = fabric::sequence_to_entry_id(self.seq_map.get(&stream));
        debug!(shard, stream = %stream, cursor = %cursor, "Listening to shard stream");

        let mut read_failures = 0u32;
        let read_retry = RetryConfig::default();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let entries = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                result = fabric::read_entries(&mut conn, &stream, &cursor, READ_BATCH) => {
                    match result {
                        Ok(entries) => {
                            read_failures = 0;
                            entries
                        }
                        Err(e) => {
                            // The connection manager reconnects underneath;
                            // pace the loop instead of tearing it down.
                            read_failures = read_failures.saturating_add(1);
                            let delay = read_retry.delay_for(read_failures.min(6));
                            warn!(
                                stream = %stream,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "Stream read failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            };

            for entry in entries {
                let _ = pulse.send(());
                if *shutdown.borrow() {
                    // Leave the message unacknowledged; redelivery after
                    // restart is filtered by the sequence map.
                    return Ok(());
                }

                cursor = entry.entry_id.clone();
                match self.process_entry(&db, &stream, &entry, replicate).await {
                    Ok(ApplyOutcome::Applied) => self.telemetry.applied(1),
                    Ok(ApplyOutcome::Duplicate) | Ok(ApplyOutcome::SelfOrigin) => {
                        self.telemetry.skipped(1)
                    }
                    Ok(_) => {}
                    Err(MarmotError::Canceled) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn process_entry(
        &self,
        db: &StreamDb,
        stream: &str,
        entry: &FabricEntry,
        replicate: bool,
    ) -> Result<ApplyOutcome> {
        handle_payload(
            &self.seq_map,
            db,
            self.node_id,
            replicate,
            stream,
            entry.sequence,
            &entry.payload,
        )
        .await
    }
}

/// The apply boundary for one delivered message.
///
/// Factored off the `Replicator` so the dedup, loop-suppression and
/// acknowledgment semantics stay testable without a live fabric.
pub(crate) async fn handle_payload(
    seq_map: &SequenceMap,
    db: &StreamDb,
    node_id: u64,
    replicate: bool,
    stream: &str,
    sequence: u64,
    payload: &[u8],
) -> Result<ApplyOutcome> {
    // Step 1: duplicate suppression against the durable cursor.
    if sequence <= seq_map.get(stream) {
        debug!(stream = %stream, sequence, "Skipping already-applied sequence");
        return Ok(ApplyOutcome::Duplicate);
    }

    let data = codec::maybe_decompress(payload)?;
    let envelope = ReplicationEnvelope::decode(&data)?;

    // Step 2: loop suppression.
    if envelope.from_node_id == node_id {
        seq_map.save(stream, sequence)?;
        return Ok(ApplyOutcome::SelfOrigin);
    }

    if !replicate {
        seq_map.save(stream, sequence)?;
        return Ok(ApplyOutcome::Disabled);
    }

    // Step 3: apply under a bounded retry budget. Event-terminal errors
    // are not retried; they are acknowledged below.
    let apply_result = retry_async(
        &RetryConfig::applier(),
        "apply",
        |e: &MarmotError| !e.is_acknowledgeable() && !matches!(e, MarmotError::Canceled),
        || db.replicate(&envelope.payload),
    )
    .await;

    match apply_result {
        Ok(()) => {
            // Step 4: durable cursor advance, then acknowledge.
            seq_map.save(stream, sequence)?;
            Ok(ApplyOutcome::Applied)
        }
        Err(e) if e.is_acknowledgeable() => {
            warn!(
                stream = %stream,
                sequence,
                table = %envelope.payload.table_name,
                error = %e,
                "Change not applicable here, acknowledging"
            );
            seq_map.save(stream, sequence)?;
            Ok(ApplyOutcome::AckedError)
        }
        Err(e) => Err(e),
    }
}
