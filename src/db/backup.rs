// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Whole-database backup and restore.
//!
//! Backups are produced server-side with `VACUUM INTO`, which writes a
//! compact, consistent single-file copy without blocking readers. The copy
//! is then scrubbed of engine triggers and tables so a restored peer
//! receives a clean user database.
//!
//! Restore copies the downloaded file over the live database at the file
//! level, under immediate transactions on both source and destination so
//! no other writer can interleave, followed by a WAL checkpoint. Existing
//! pool connections keep working because the inode is preserved.

use super::{open_single, quote_ident, StreamDb};
use crate::error::Result;
use crate::event::fingerprint_bytes;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::SqlitePool;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

impl StreamDb {
    /// Produce a clean single-file backup of the database at `dest`.
    ///
    /// The backup carries all user state but none of the engine's shadow
    /// tables, global index, or triggers.
    pub async fn backup_to(&self, dest: &Path) -> Result<()> {
        sqlx::query("VACUUM INTO ?")
            .bind(dest.to_string_lossy().as_ref())
            .execute(self.pool())
            .await?;

        // The copy is private now: strip engine objects and compact.
        let bk_pool = open_single(dest, SqliteJournalMode::Truncate).await?;
        strip_engine_objects(&bk_pool, self.prefix()).await?;
        sqlx::raw_sql("VACUUM").execute(&bk_pool).await?;
        bk_pool.close().await;

        info!(dest = %dest.display(), "Database backup complete");
        Ok(())
    }

    /// Replace the live database with the contents of `backup`.
    ///
    /// Immediate transactions on both files keep writers out while the
    /// main file and its WAL siblings are copied; a checkpoint afterwards
    /// makes the restored state visible to every pooled connection.
    pub async fn restore_from(&self, backup: &Path) -> Result<()> {
        let src_pool = open_single(backup, SqliteJournalMode::Wal).await?;

        let mut src_conn = src_pool.acquire().await?;
        let mut dest_conn = self.pool().acquire().await?;

        sqlx::raw_sql("BEGIN IMMEDIATE").execute(&mut *src_conn).await?;
        sqlx::raw_sql("BEGIN IMMEDIATE").execute(&mut *dest_conn).await?;

        let copy_result = copy_database_files(backup, Path::new(self.path())).await;

        // Nothing was written inside either transaction; ROLLBACK just
        // releases the locks without touching the freshly copied files.
        sqlx::raw_sql("ROLLBACK").execute(&mut *src_conn).await?;
        sqlx::raw_sql("ROLLBACK").execute(&mut *dest_conn).await?;
        drop(src_conn);
        drop(dest_conn);
        src_pool.close().await;

        copy_result?;
        self.checkpoint().await?;

        info!(backup = %backup.display(), "Database restore complete");
        Ok(())
    }
}

/// Drop every engine trigger and table from a database.
pub async fn strip_engine_objects(pool: &SqlitePool, prefix: &str) -> Result<()> {
    let triggers: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'trigger' AND name LIKE ?")
            .bind(format!("{}%", prefix))
            .fetch_all(pool)
            .await?;
    for (name,) in triggers {
        sqlx::raw_sql(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&name)))
            .execute(pool)
            .await?;
    }

    let tables: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?")
            .bind(format!("{}%", prefix))
            .fetch_all(pool)
            .await?;
    for (name,) in tables {
        sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Copy a database file and its WAL siblings.
async fn copy_database_files(from: &Path, to: &Path) -> Result<()> {
    copy_file(from, to).await?;
    for suffix in ["-wal", "-shm"] {
        let from_sibling = sibling(from, suffix);
        let to_sibling = sibling(to, suffix);
        if from_sibling.exists() {
            copy_file(&from_sibling, &to_sibling).await?;
        } else if to_sibling.exists() {
            // No source journal: neutralize any stale one on the target.
            tokio::fs::remove_file(&to_sibling).await?;
        }
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    let bytes = tokio::fs::copy(from, to).await?;
    debug!(from = %from.display(), to = %to.display(), bytes, "File copied");
    Ok(())
}

/// 64-bit content hash of a file, hex-encoded for the snapshot tag header.
pub fn file_hash(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    let tag = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    Ok(format!("{:x}", tag))
}

/// Hash of a byte slice in the same format as [`file_hash`].
pub fn content_tag(data: &[u8]) -> String {
    format!("{:x}", fingerprint_bytes(data))
}
