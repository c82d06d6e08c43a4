// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot blobs over the log fabric.
//!
//! Objects live in a hash keyed `<bucket>/<name>` with two fields:
//! `data` (the file bytes) and `tag` (the hex content hash that serves as
//! the `marmot-snapshot-tag` header). The bucket name defaults to
//! `<stream_prefix>-snapshot-store`.

use super::{SnapshotStorage, HASH_HEADER_KEY};
use crate::config::FabricStoreConfig;
use crate::db::backup::content_tag;
use crate::error::{MarmotError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::path::Path;
use tracing::info;

pub struct FabricStorage {
    conn: ConnectionManager,
    bucket: String,
}

impl FabricStorage {
    pub fn new(conn: ConnectionManager, stream_prefix: &str, cfg: &FabricStoreConfig) -> Self {
        let bucket = if cfg.bucket.is_empty() {
            format!("{}-snapshot-store", stream_prefix)
        } else {
            cfg.bucket.clone()
        };
        Self { conn, bucket }
    }

    fn object_key(&self, name: &str) -> String {
        format!("{}/{}", self.bucket, name)
    }
}

#[async_trait]
impl SnapshotStorage for FabricStorage {
    async fn upload(&self, name: &str, local_path: &Path) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        let tag = content_tag(&data);
        let key = self.object_key(name);

        let mut conn = self.conn.clone();
        // Replace wholesale so the fixed name always points at the
        // newest snapshot.
        let _: () = conn
            .del(&key)
            .await
            .map_err(|e| MarmotError::fabric("DEL", e))?;
        let _: () = redis::cmd("HSET")
            .arg(&key)
            .arg("data")
            .arg(data.as_slice())
            .arg("tag")
            .arg(&tag)
            .query_async(&mut conn)
            .await
            .map_err(|e| MarmotError::fabric("HSET", e))?;

        info!(
            object = %key,
            size = data.len(),
            tag = %tag,
            header = HASH_HEADER_KEY,
            "Snapshot saved to fabric store"
        );
        Ok(())
    }

    async fn download(&self, local_path: &Path, name: &str) -> Result<()> {
        let key = self.object_key(name);
        let mut conn = self.conn.clone();

        let data: Option<Vec<u8>> = conn
            .hget(&key, "data")
            .await
            .map_err(|e| MarmotError::fabric("HGET", e))?;

        let data = data.ok_or(MarmotError::NoSnapshotFound)?;
        tokio::fs::write(local_path, &data).await?;

        info!(object = %key, size = data.len(), "Snapshot downloaded from fabric store");
        Ok(())
    }

    async fn head_tag(&self, name: &str) -> Result<Option<String>> {
        let key = self.object_key(name);
        let mut conn = self.conn.clone();

        let exists: bool = conn
            .exists(&key)
            .await
            .map_err(|e| MarmotError::fabric("EXISTS", e))?;
        if !exists {
            return Ok(None);
        }

        let tag: Option<String> = conn
            .hget(&key, "tag")
            .await
            .map_err(|e| MarmotError::fabric("HGET", e))?;

        // An object without its hash header is unusable.
        match tag {
            Some(tag) => Ok(Some(tag)),
            None => Err(MarmotError::InvalidSnapshot),
        }
    }
}
