//! # Marmot
//!
//! A leaderless, multi-writer replication engine for SQLite. Every node
//! owns a local database file; the engine captures row-level mutations on
//! watched tables through triggers, publishes them to a sharded durable
//! log, and applies remote mutations back into each peer's database.
//! Replicas converge under concurrent writes on any node, with
//! last-writer-wins resolution at the row level and no central
//! coordinator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               marmot                                 │
//! │                                                                      │
//! │  local writes ─► triggers ─► shadow tables + global index            │
//! │                                   │                                  │
//! │  ┌─────────────┐    ┌─────────────▼──────────┐    ┌───────────────┐  │
//! │  │ FileWatcher │───►│ Scanner (drain cycle)  │───►│ ShardRouter / │  │
//! │  │ + poll tick │    │ fingerprint + envelope │    │  Publisher    │  │
//! │  └─────────────┘    └────────────────────────┘    └───────┬───────┘  │
//! │                                                           ▼          │
//! │                                              sharded durable streams │
//! │                                                           │          │
//! │  ┌──────────────┐    ┌───────────────────────┐    ┌───────▼───────┐  │
//! │  │ SequenceMap  │◄───│ Applier (upsert/del)  │◄───│ Subscriber    │  │
//! │  │ (CBOR file)  │    │ per-event transaction │    │ (one / shard) │  │
//! │  └──────────────┘    └───────────────────────┘    └───────────────┘  │
//! │                                                                      │
//! │  SnapshotEngine: lease-guarded VACUUM INTO backups ⇄ object storage  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! * Events for the same primary key always land on the same shard, so
//!   per-row ordering holds cluster-wide.
//! * Delivery is at-least-once; apply is at-most-once per node via the
//!   durable sequence map.
//! * Messages originating at the local node are suppressed on receipt.
//! * A replica that falls behind a stream's retained window bootstraps
//!   from the latest uploaded snapshot.

pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod fabric;
pub mod lease;
pub mod replicator;
pub mod resilience;
pub mod seq_map;
pub mod snapshot;
pub mod telemetry;
pub mod value;
pub mod watcher;

// Re-exports for convenience
pub use codec::ReplicationEnvelope;
pub use config::Config;
pub use db::StreamDb;
pub use engine::Engine;
pub use error::{MarmotError, Result};
pub use event::ChangeEvent;
pub use replicator::Replicator;
pub use seq_map::SequenceMap;
pub use telemetry::Telemetry;
pub use value::Value;
