// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Every failure mode the engine can surface is a variant of [`MarmotError`].
//! Callers branch on the kind; retryable-vs-fatal classification is explicit
//! via [`MarmotError::is_retryable()`].
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Fabric` | Yes | Network errors, timeouts against the log fabric |
//! | `NotReadyToPublish` | Yes | Publisher asked the scanner to back off |
//! | `Canceled` | No | Shutdown in progress; abandons the current row/message |
//! | `Db` | No | Local SQLite errors (busy retry happens below this layer) |
//! | `NoTableMapping` | No | Change for a table this node does not replicate |
//! | `InvalidOperation` | No | Unknown change type on a decoded event |
//! | `MissingChangeRow` | No | Global index references a missing shadow row (fatal) |
//! | `InvalidSnapshot` | No | Snapshot object lacks its hash header |
//! | `NoSnapshotFound` | No | Storage adapter has no object (clean no-op) |
//! | `PendingSnapshot` | No | A snapshot save is already in flight locally |
//! | `CodecEncode` / `CodecDecode` | No | Malformed or unwritable CBOR |
//! | `Decompression` | No | Payload corruption (zstd decode failed) |
//! | `Config` | No | Configuration invalid |
//! | `Storage` | Yes | Snapshot storage adapter failure |
//! | `Io` | No | Filesystem failure (sequence map, temp dirs, backups) |

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, MarmotError>;

/// Errors that can occur while capturing, publishing, or applying changes.
#[derive(Error, Debug)]
pub enum MarmotError {
    /// Log fabric connection or command error.
    ///
    /// Typically transient (network timeouts, connection drops).
    #[error("fabric error ({operation}): {message}")]
    Fabric {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Local database error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// The publish callback is not ready to accept changes.
    ///
    /// Breaks the current scan cycle; the row is retried on the next
    /// watcher tick.
    #[error("not ready to publish changes")]
    NotReadyToPublish,

    /// The engine's state context was canceled.
    ///
    /// Loops return without acknowledging their current message and
    /// without writing a partial sequence-map update.
    #[error("operation canceled")]
    Canceled,

    /// A change arrived for a table not present in the schema cache.
    ///
    /// The event is acknowledged without applying; this node does not
    /// replicate the table.
    #[error("no table mapping found for {table}")]
    NoTableMapping { table: String },

    /// A decoded event carries an unknown change type.
    ///
    /// Terminal for that event; acknowledged to avoid a poison loop.
    #[error("invalid operation type {op}")]
    InvalidOperation { op: String },

    /// The global change index references a shadow row that does not exist.
    ///
    /// This invariant only breaks under external tampering or a bug; the
    /// scanner aborts loudly and the process must terminate.
    #[error("global change row {change_id} not found in {table} change log")]
    MissingChangeRow { table: String, change_id: i64 },

    /// The snapshot object is missing its content-hash header.
    #[error("invalid snapshot")]
    InvalidSnapshot,

    /// The storage adapter reports no snapshot object.
    #[error("no snapshot found")]
    NoSnapshotFound,

    /// A snapshot save is already in progress on this node.
    #[error("system busy capturing snapshot")]
    PendingSnapshot,

    /// CBOR encoding failed.
    #[error("codec encode failed: {0}")]
    CodecEncode(#[from] minicbor::encode::Error<std::convert::Infallible>),

    /// CBOR decoding failed.
    #[error("codec decode failed: {0}")]
    CodecDecode(#[from] minicbor::decode::Error),

    /// Zstd decompression failure; the payload is corrupt at the source.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// Invalid or missing configuration. Fix the config file and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Snapshot storage adapter failure (upload/download).
    #[error("snapshot storage error: {0}")]
    Storage(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MarmotError {
    /// Create a fabric error from a redis error.
    pub fn fabric(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Fabric {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a fabric error without a source.
    pub fn fabric_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fabric {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fabric { .. } => true,
            Self::NotReadyToPublish => true,
            Self::Storage(_) => true,
            Self::Db(_) => false,
            Self::Canceled => false,
            Self::NoTableMapping { .. } => false,
            Self::InvalidOperation { .. } => false,
            Self::MissingChangeRow { .. } => false,
            Self::InvalidSnapshot => false,
            Self::NoSnapshotFound => false,
            Self::PendingSnapshot => false,
            Self::CodecEncode(_) => false,
            Self::CodecDecode(_) => false,
            Self::Decompression(_) => false,
            Self::Config(_) => false,
            Self::Io(_) => false,
        }
    }

    /// Errors that terminate the current event but must not stall the
    /// subscriber: the message is acknowledged and the loop moves on.
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(
            self,
            Self::NoTableMapping { .. } | Self::InvalidOperation { .. }
        )
    }
}

impl From<redis::RedisError> for MarmotError {
    fn from(e: redis::RedisError) -> Self {
        Self::fabric("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_is_retryable() {
        let err = MarmotError::fabric_msg("XADD", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XADD"));
    }

    #[test]
    fn test_not_ready_is_retryable() {
        assert!(MarmotError::NotReadyToPublish.is_retryable());
    }

    #[test]
    fn test_canceled_not_retryable() {
        assert!(!MarmotError::Canceled.is_retryable());
    }

    #[test]
    fn test_no_table_mapping_acknowledgeable() {
        let err = MarmotError::NoTableMapping {
            table: "Books".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_acknowledgeable());
        assert!(err.to_string().contains("Books"));
    }

    #[test]
    fn test_invalid_operation_acknowledgeable() {
        let err = MarmotError::InvalidOperation {
            op: "truncate".to_string(),
        };
        assert!(err.is_acknowledgeable());
        assert!(err.to_string().contains("truncate"));
    }

    #[test]
    fn test_missing_change_row_fatal() {
        let err = MarmotError::MissingChangeRow {
            table: "Books".to_string(),
            change_id: 42,
        };
        assert!(!err.is_retryable());
        assert!(!err.is_acknowledgeable());
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_snapshot_kinds_not_retryable() {
        assert!(!MarmotError::InvalidSnapshot.is_retryable());
        assert!(!MarmotError::NoSnapshotFound.is_retryable());
        assert!(!MarmotError::PendingSnapshot.is_retryable());
    }

    #[test]
    fn test_storage_retryable() {
        assert!(MarmotError::Storage("timeout".to_string()).is_retryable());
    }

    #[test]
    fn test_config_not_retryable() {
        assert!(!MarmotError::Config("bad shard count".to_string()).is_retryable());
    }

    #[test]
    fn test_decompression_not_retryable() {
        let err = MarmotError::Decompression("invalid zstd header".to_string());
        assert!(!err.is_retryable());
    }
}
