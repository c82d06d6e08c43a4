// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot save/restore protocol.
//!
//! # Save
//!
//! 1. Take the local pending guard; a save already in flight returns
//!    `PendingSnapshot`.
//! 2. Acquire the cluster-wide `"snapshot"` lease (10 s TTL, refreshed at
//!    half-life while the upload runs). Held elsewhere → return without
//!    saving.
//! 3. Back the database up into a temp directory (`VACUUM INTO` + engine
//!    object strip), hash it, upload under the fixed object name.
//! 4. Remove the temp directory with bounded retries.
//!
//! # Restore
//!
//! Download into a temp directory and replace the live database file.
//! Before downloading, the local state is backed up and hashed; when the
//! stored object's tag matches, the restore is a no-op. The sequence map
//! is deliberately left untouched: the snapshot advances table state, and
//! subscribers skip forward via the retained-window check on their next
//! iteration.

use super::{SnapshotStorage, SNAPSHOT_FILE_NAME, TEMP_DIR_PREFIX};
use crate::db::backup::file_hash;
use crate::db::StreamDb;
use crate::error::{MarmotError, Result};
use crate::lease::LeaseStore;
use crate::resilience::{retry_async, RetryConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Cluster lease name serializing snapshot saves.
const SNAPSHOT_LEASE: &str = "snapshot";

/// Lease TTL; refreshed at half-life while a save runs.
const SNAPSHOT_LEASE_TTL: Duration = Duration::from_secs(10);

/// Takes, uploads and restores whole-database snapshots.
pub struct SnapshotEngine {
    db: Arc<StreamDb>,
    storage: Arc<dyn SnapshotStorage>,
    lease: LeaseStore,
    shutdown: watch::Receiver<bool>,
    pending: tokio::sync::Mutex<()>,
}

impl SnapshotEngine {
    pub fn new(
        db: Arc<StreamDb>,
        storage: Arc<dyn SnapshotStorage>,
        lease: LeaseStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            storage,
            lease,
            shutdown,
            pending: tokio::sync::Mutex::new(()),
        }
    }

    /// Take a consistent backup and upload it.
    ///
    /// Returns `Ok(false)` when another node holds the snapshot lease,
    /// `Err(PendingSnapshot)` when a local save is already running.
    pub async fn save(&self) -> Result<bool> {
        let _guard = self
            .pending
            .try_lock()
            .map_err(|_| MarmotError::PendingSnapshot)?;

        let acquired = self
            .lease
            .acquire_refreshing(SNAPSHOT_LEASE, SNAPSHOT_LEASE_TTL, self.shutdown.clone())
            .await?;
        if !acquired {
            info!("Snapshot lease held elsewhere, skipping save");
            return Ok(false);
        }

        let tmp = make_temp_dir()?;
        let result = self.save_into(&tmp).await;
        cleanup_dir(&tmp).await;
        result.map(|()| true)
    }

    async fn save_into(&self, tmp: &Path) -> Result<()> {
        let bk_path = tmp.join(SNAPSHOT_FILE_NAME);
        self.db.backup_to(&bk_path).await?;

        let hash = file_hash(&bk_path)?;
        self.storage.upload(SNAPSHOT_FILE_NAME, &bk_path).await?;

        info!(hash = %hash, "Snapshot saved");
        Ok(())
    }

    /// Download the stored snapshot and replace the local database.
    ///
    /// A missing object is a clean no-op; so is a stored object whose tag
    /// matches the hash of the local state.
    pub async fn restore(&self) -> Result<()> {
        let _guard = self.pending.lock().await;

        let tmp = make_temp_dir()?;
        let result = self.restore_from(&tmp).await;
        cleanup_dir(&tmp).await;
        result
    }

    async fn restore_from(&self, tmp: &Path) -> Result<()> {
        let bk_path = tmp.join(SNAPSHOT_FILE_NAME);

        // Hash what we have so an up-to-date replica skips the download.
        self.db.backup_to(&bk_path).await?;
        let local_hash = file_hash(&bk_path)?;

        match self.storage.head_tag(SNAPSHOT_FILE_NAME).await {
            Ok(Some(tag)) if tag == local_hash => {
                info!("Snapshot already up to date, skipping restore");
                return Ok(());
            }
            Ok(_) => {}
            Err(MarmotError::NoSnapshotFound) => return Ok(()),
            Err(e) => return Err(e),
        }

        match self.storage.download(&bk_path, SNAPSHOT_FILE_NAME).await {
            Ok(()) => {}
            Err(MarmotError::NoSnapshotFound) => return Ok(()),
            Err(e) => return Err(e),
        }

        info!(path = %bk_path.display(), "Downloaded snapshot, restoring");
        self.db.restore_from(&bk_path).await?;
        info!("Restore complete");
        Ok(())
    }
}

fn make_temp_dir() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(TEMP_DIR_PREFIX)
        .tempdir()?;
    // Ownership passes to cleanup_dir; auto-delete-on-drop would race the
    // bounded-retry removal below.
    #[allow(deprecated)]
    Ok(dir.into_path())
}

/// Remove a snapshot working directory, retrying transient failures.
async fn cleanup_dir(path: &Path) {
    let result = retry_async(
        &RetryConfig::cleanup(),
        "snapshot-temp-cleanup",
        |_e: &std::io::Error| true,
        || async { tokio::fs::remove_dir_all(path).await },
    )
    .await;

    if let Err(e) = result {
        error!(
            path = %path.display(),
            error = %e,
            "Unable to clean up temp path, this may waste disk"
        );
    }
}
