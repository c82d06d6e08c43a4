// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot storage and the save/restore protocol.
//!
//! The engine sees storage through the two-method [`SnapshotStorage`]
//! contract; the concrete backend (fabric blob bucket, S3, WebDAV, SFTP)
//! is chosen by configuration and never leaks past this module.

mod engine;
mod fabric;
mod s3;
mod sftp;
mod webdav;

pub use engine::SnapshotEngine;
pub use fabric::FabricStorage;
pub use s3::S3Storage;
pub use sftp::SftpStorage;
pub use webdav::WebDavStorage;

use crate::config::{Config, SnapshotStoreType};
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::path::Path;
use std::sync::Arc;

/// Fixed object name for the uploaded snapshot.
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.db";

/// Metadata header carrying the snapshot's 64-bit content hash (hex).
pub const HASH_HEADER_KEY: &str = "marmot-snapshot-tag";

/// Prefix for snapshot working directories under the system temp dir.
pub const TEMP_DIR_PREFIX: &str = "marmot-snapshot-";

/// Uniform storage contract used by the snapshot engine.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Upload the file at `local_path` under the object name `name`.
    async fn upload(&self, name: &str, local_path: &Path) -> Result<()>;

    /// Download the object `name` into `local_path`.
    ///
    /// Fails with `NoSnapshotFound` when the object does not exist.
    async fn download(&self, local_path: &Path, name: &str) -> Result<()>;

    /// Content-hash tag of the stored object, when the backend carries
    /// metadata. Used to short-circuit no-op restores.
    async fn head_tag(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Build the storage adapter selected by `snapshot.store`.
///
/// The fabric store reuses the replication log's connection; the other
/// backends establish their own clients.
pub async fn new_snapshot_storage(
    cfg: &Config,
    fabric_conn: ConnectionManager,
) -> Result<Arc<dyn SnapshotStorage>> {
    let storage: Arc<dyn SnapshotStorage> = match cfg.snapshot.store {
        SnapshotStoreType::Fabric => Arc::new(FabricStorage::new(
            fabric_conn,
            &cfg.fabric.stream_prefix,
            &cfg.snapshot.fabric,
        )),
        SnapshotStoreType::S3 => Arc::new(S3Storage::connect(&cfg.snapshot.s3).await?),
        SnapshotStoreType::Webdav => {
            Arc::new(WebDavStorage::connect(&cfg.snapshot.webdav, &cfg.node_name()).await?)
        }
        SnapshotStoreType::Sftp => Arc::new(SftpStorage::connect(&cfg.snapshot.sftp).await?),
    };
    Ok(storage)
}
