// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster-wide leases over the fabric's key-value store.
//!
//! A lease serializes a global operation (snapshot save) across nodes.
//! Each lease is one fabric hash keyed `<stream_prefix>-lease-<name>`,
//! holding the holder's node token plus a CBOR record of
//! `{node_id, timestamp_ms}` for observability. Acquisition runs as a
//! single atomic script: create if absent, refresh if held by us, refuse
//! otherwise. Expiry is enforced server-side with a TTL, so an expired
//! holder simply vanishes and the next acquire takes over.

use crate::error::{MarmotError, Result};
use minicbor::{Decoder, Encoder};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// create-if-absent / refresh-if-ours, with a server-side TTL.
/// KEYS[1] = lease key, ARGV[1] = holder token, ARGV[2] = info record,
/// ARGV[3] = ttl millis. Returns 1 when the lease is ours.
const ACQUIRE_SCRIPT: &str = r#"
local holder = redis.call('HGET', KEYS[1], 'holder')
if holder == false or holder == ARGV[1] then
  redis.call('HSET', KEYS[1], 'holder', ARGV[1], 'info', ARGV[2])
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
  return 1
end
return 0
"#;

/// Lease record persisted alongside the holder token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub node_id: u64,
    pub timestamp_ms: i64,
}

impl LeaseInfo {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        let mut e = Encoder::new(&mut buf);
        e.map(2)?;
        e.str("node_id")?.u64(self.node_id)?;
        e.str("timestamp_ms")?.i64(self.timestamp_ms)?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(data);
        let len = d.map()?.ok_or_else(|| {
            MarmotError::from(minicbor::decode::Error::message("indefinite map"))
        })?;
        let mut node_id = 0u64;
        let mut timestamp_ms = 0i64;
        for _ in 0..len {
            match d.str()? {
                "node_id" => node_id = d.u64()?,
                "timestamp_ms" => timestamp_ms = d.i64()?,
                _ => d.skip()?,
            }
        }
        Ok(Self {
            node_id,
            timestamp_ms,
        })
    }
}

/// Handle for acquiring and refreshing named leases.
#[derive(Clone)]
pub struct LeaseStore {
    conn: ConnectionManager,
    key_prefix: String,
    node_id: u64,
}

impl LeaseStore {
    pub fn new(conn: ConnectionManager, stream_prefix: &str, node_id: u64) -> Self {
        Self {
            conn,
            key_prefix: format!("{}-lease-", stream_prefix),
            node_id,
        }
    }

    fn lease_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Try to take (or refresh) the named lease.
    ///
    /// Returns `false` when another node holds it and the hold has not
    /// expired yet.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool> {
        let info = LeaseInfo {
            node_id: self.node_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let payload = info.encode()?;

        let mut conn = self.conn.clone();
        let acquired: i64 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.lease_key(name))
            .arg(self.node_id.to_string())
            .arg(payload)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MarmotError::fabric("lease-acquire", e))?;

        Ok(acquired == 1)
    }

    /// Acquire once and, on success, keep the lease refreshed at `ttl/2`
    /// intervals until the shutdown signal fires.
    pub async fn acquire_refreshing(
        &self,
        name: &str,
        ttl: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<bool> {
        let acquired = self.acquire(name, ttl).await?;
        if !acquired {
            return Ok(false);
        }

        let store = self.clone();
        let name = name.to_string();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.acquire(&name, ttl).await {
                            Ok(true) => {
                                debug!(lease = %name, "Lease refreshed");
                            }
                            Ok(false) => {
                                warn!(lease = %name, "Unable to refresh lease");
                            }
                            Err(e) => {
                                warn!(lease = %name, error = %e, "Error refreshing lease");
                                return;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!(lease = %name, "Lease refresher stopping");
                            return;
                        }
                    }
                }
            }
        });

        Ok(true)
    }
}
