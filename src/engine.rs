// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level orchestration.
//!
//! [`Engine`] wires the pieces together and runs the event loop:
//!
//! 1. Open the database pool and force a WAL checkpoint.
//! 2. Connect to the fabric, build the snapshot storage adapter and the
//!    replicator (streams, sequence map, lease store).
//! 3. Restore from snapshot when this replica has fallen behind.
//! 4. Enumerate user tables, install capture, and start the scanner fed
//!    by the file watcher.
//! 5. Fan out one subscriber task per shard.
//! 6. Tick the cleanup sweeper and the snapshot timer; reset the idle
//!    shutdown timer on every pulse from either pipeline direction.
//!
//! A subscriber or scanner returning an error lands on the error channel
//! and terminates the engine with that error; the process exits non-zero.

use crate::codec::ReplicationEnvelope;
use crate::config::Config;
use crate::db::change_log::cleanup_cutoff;
use crate::db::{ChangeSink, StreamDb};
use crate::error::{MarmotError, Result};
use crate::event::ChangeEvent;
use crate::fabric;
use crate::replicator::Replicator;
use crate::snapshot::new_snapshot_storage;
use crate::telemetry::Telemetry;
use crate::watcher::ChangeWatcher;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// The wired-up engine, ready to run.
pub struct Engine {
    cfg: Config,
    db: Arc<StreamDb>,
    replicator: Arc<Replicator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    /// Open the database, connect to the fabric, and build the
    /// replication stack.
    pub async fn bootstrap(cfg: Config, telemetry: Telemetry) -> Result<Self> {
        let db = Arc::new(StreamDb::open(&cfg.db_path, telemetry.clone()).await?);

        let conn = fabric::connect(&cfg.fabric, &cfg.node_name()).await?;
        let storage = new_snapshot_storage(&cfg, conn.clone()).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let replicator = Arc::new(
            Replicator::new(
                &cfg,
                conn,
                Arc::clone(&db),
                storage,
                telemetry,
                shutdown_rx.clone(),
            )
            .await?,
        );

        Ok(Self {
            cfg,
            db,
            replicator,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn db(&self) -> &Arc<StreamDb> {
        &self.db
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Run until idle shutdown, interrupt, or a fatal pipeline error.
    pub async fn run(&self) -> Result<()> {
        if self.cfg.snapshot.enabled && self.cfg.replicate {
            self.replicator.restore_snapshot().await?;
        }

        info!("Listing tables to watch");
        let tables = self.db.list_user_tables().await?;
        info!(count = tables.len(), "Starting change data capture pipeline");
        self.db.install_cdc(&tables).await?;

        let (pulse_tx, mut pulse_rx) = mpsc::unbounded_channel::<()>();
        let (err_tx, mut err_rx) = mpsc::channel::<MarmotError>(self.replicator.shards() as usize + 1);

        let sink: Arc<PublishSink> = Arc::new(PublishSink {
            db: Arc::clone(&self.db),
            replicator: Arc::clone(&self.replicator),
            publish: self.cfg.publish,
            pulse: pulse_tx.clone(),
            shutdown: self.shutdown_rx.clone(),
        });

        self.spawn_scanner(Arc::clone(&sink), err_tx.clone())?;
        self.spawn_subscribers(pulse_tx.clone(), err_tx.clone());

        // Tickers. The cleanup interval doubles as the sweeper's age
        // threshold; the snapshot ticker is gated on configuration.
        let cleanup_interval = Duration::from_millis(self.cfg.cleanup_interval.max(100));
        let mut cleanup_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + cleanup_interval, cleanup_interval);

        let snapshot_timer_enabled =
            self.cfg.snapshot.enabled && self.cfg.publish && self.cfg.snapshot.interval > 0;
        let snapshot_interval = Duration::from_millis(self.cfg.snapshot.interval.max(1000));
        let mut snapshot_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + snapshot_interval, snapshot_interval);

        // Idle shutdown: any pulse pushes the deadline out.
        let idle_enabled = self.cfg.sleep_timeout > 0;
        let idle_timeout = Duration::from_millis(self.cfg.sleep_timeout.max(1));
        let mut idle_deadline = tokio::time::Instant::now() + idle_timeout;

        loop {
            tokio::select! {
                Some(e) = err_rx.recv() => {
                    error!(error = %e, "Terminated listener");
                    let _ = self.shutdown_tx.send(true);
                    return Err(e);
                }
                Some(()) = pulse_rx.recv() => {
                    idle_deadline = tokio::time::Instant::now() + idle_timeout;
                }
                _ = cleanup_ticker.tick() => {
                    let cutoff = cleanup_cutoff(self.cfg.cleanup_interval);
                    match self.db.cleanup_change_logs(cutoff).await {
                        Ok(count) if count > 0 => {
                            debug!(count, "Cleaned up change logs");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Unable to cleanup change logs"),
                    }
                }
                _ = snapshot_ticker.tick(), if snapshot_timer_enabled => {
                    let due = match self.replicator.last_save_snapshot_time() {
                        Some(last) => last.elapsed() >= snapshot_interval,
                        None => true,
                    };
                    if due {
                        info!("Triggering timer based snapshot save");
                        if let Err(e) = self.replicator.save_snapshot().await {
                            warn!(error = %e, "Timer based snapshot save failed");
                        }
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline), if idle_enabled => {
                    info!("No more events to process, initiating shutdown");
                    let _ = self.shutdown_tx.send(true);
                    if self.cfg.snapshot.enabled && self.cfg.publish {
                        info!("Saving snapshot before going to sleep");
                        if let Err(e) = self.replicator.save_snapshot().await {
                            warn!(error = %e, "Final snapshot save failed");
                        }
                    }
                    return Ok(());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    let _ = self.shutdown_tx.send(true);
                    return Ok(());
                }
            }
        }
    }

    /// Scanner task: drains the change log on every watcher wake.
    fn spawn_scanner(&self, sink: Arc<PublishSink>, err_tx: mpsc::Sender<MarmotError>) -> Result<()> {
        let mut watcher = ChangeWatcher::spawn(
            &self.cfg.db_path,
            Duration::from_millis(self.cfg.polling_interval.max(1)),
            self.shutdown_rx.clone(),
        )?;

        let db = Arc::clone(&self.db);
        let scan_max = self.cfg.scan_max_changes;
        tokio::spawn(async move {
            while let Some(()) = watcher.wake().await {
                match db.publish_pending(scan_max, sink.as_ref()).await {
                    Ok(_) => {}
                    Err(e) => {
                        // Scan failures are invariant violations or local
                        // database trouble; both need an operator.
                        error!(error = %e, "Change scan failed");
                        let _ = err_tx.send(e).await;
                        return;
                    }
                }
            }
            debug!("Scanner stopped");
        });
        Ok(())
    }

    /// One subscriber task per shard.
    fn spawn_subscribers(&self, pulse: mpsc::UnboundedSender<()>, err_tx: mpsc::Sender<MarmotError>) {
        for shard in 1..=self.replicator.shards() {
            let replicator = Arc::clone(&self.replicator);
            let db = Arc::clone(&self.db);
            let replicate = self.cfg.replicate;
            let pulse = pulse.clone();
            let shutdown = self.shutdown_rx.clone();
            let err_tx = err_tx.clone();

            tokio::spawn(async move {
                debug!(shard, "Listening stream");
                if let Err(e) = replicator.listen(shard, db, replicate, pulse, shutdown).await {
                    let _ = err_tx.send(e).await;
                }
            });
        }
    }
}

/// Capture-side sink: fingerprint, wrap, encode, and publish one change.
///
/// Emits a pulse for the idle timer on every offered change, honors the
/// engine's cancellation, and turns the publish direction off without
/// disturbing capture bookkeeping when `publish = false`.
struct PublishSink {
    db: Arc<StreamDb>,
    replicator: Arc<Replicator>,
    publish: bool,
    pulse: mpsc::UnboundedSender<()>,
    shutdown: watch::Receiver<bool>,
}

impl ChangeSink for PublishSink {
    fn publish_change(
        &self,
        event: ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _ = self.pulse.send(());
            if *self.shutdown.borrow() {
                return Err(MarmotError::Canceled);
            }
            if !self.publish {
                return Ok(());
            }

            let pk_columns = self
                .db
                .primary_key_columns(&event.table_name)
                .ok_or_else(|| MarmotError::NoTableMapping {
                    table: event.table_name.clone(),
                })?;
            let fingerprint = event.fingerprint(&pk_columns)?;

            let envelope = ReplicationEnvelope::new(self.replicator.node_id(), event);
            let payload = envelope.encode()?;
            self.replicator.publish(fingerprint, payload).await?;
            Ok(())
        })
    }
}
