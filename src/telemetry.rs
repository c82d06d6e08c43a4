//! Metrics for observability.
//!
//! Counters and histograms are emitted through the `metrics` facade; when
//! `prometheus.enable` is set an HTTP exporter is installed at
//! `prometheus.bind`. With the exporter absent the facade is a no-op, so
//! instrumented code paths never need to branch on configuration.
//!
//! Metric names are `<namespace>_<subsystem>_<name>`; every sample carries
//! a `node_id` label so multi-node scrapes stay distinguishable.

use crate::config::PrometheusConfig;
use crate::error::{MarmotError, Result};
use metrics::{counter, gauge, histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Handle for emitting engine metrics.
#[derive(Debug, Clone)]
pub struct Telemetry {
    prefix: String,
    node_id: String,
}

impl Telemetry {
    /// Build the handle and, when enabled, install the Prometheus exporter.
    pub fn init(cfg: &PrometheusConfig, node_id: u64) -> Result<Self> {
        let telemetry = Self::disabled(cfg, node_id);

        if cfg.enable {
            let addr: SocketAddr = cfg
                .bind
                .parse()
                .map_err(|_| MarmotError::Config(format!("bad prometheus.bind {}", cfg.bind)))?;
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| MarmotError::Config(format!("prometheus exporter: {}", e)))?;
            info!(bind = %cfg.bind, "Prometheus exporter listening");
        }

        Ok(telemetry)
    }

    /// Handle without an exporter; all samples fall into the no-op recorder.
    pub fn disabled(cfg: &PrometheusConfig, node_id: u64) -> Self {
        let mut prefix = cfg.namespace.clone();
        if !cfg.subsystem.is_empty() {
            prefix.push('_');
            prefix.push_str(&cfg.subsystem);
        }
        if prefix.is_empty() {
            prefix = "marmot".to_string();
        }
        Self {
            prefix,
            node_id: node_id.to_string(),
        }
    }

    fn name(&self, metric: &str) -> String {
        format!("{}_{}", self.prefix, metric)
    }

    /// Rows published to the fabric.
    pub fn published(&self, count: u64) {
        counter!(self.name("published"), "node_id" => self.node_id.clone()).increment(count);
    }

    /// Global-index rows waiting to be published.
    pub fn pending_publish(&self, pending: u64) {
        gauge!(self.name("pending_publish"), "node_id" => self.node_id.clone()).set(pending as f64);
    }

    /// Latency of counting pending changes.
    pub fn count_changes(&self, elapsed: Duration) {
        histogram!(self.name("count_changes"), "node_id" => self.node_id.clone())
            .record(elapsed.as_secs_f64() * 1_000_000.0);
    }

    /// Latency of scanning change rows out of the database.
    pub fn scan_changes(&self, elapsed: Duration) {
        histogram!(self.name("scan_changes"), "node_id" => self.node_id.clone())
            .record(elapsed.as_secs_f64() * 1_000_000.0);
    }

    /// Remote events applied locally.
    pub fn applied(&self, count: u64) {
        counter!(self.name("applied"), "node_id" => self.node_id.clone()).increment(count);
    }

    /// Remote events skipped (duplicates and self-originated).
    pub fn skipped(&self, count: u64) {
        counter!(self.name("skipped"), "node_id" => self.node_id.clone()).increment(count);
    }

    /// Snapshot saves completed.
    pub fn snapshot_saved(&self) {
        counter!(self.name("snapshot_saves"), "node_id" => self.node_id.clone()).increment(1);
    }

    /// Published shadow rows deleted by the sweeper.
    pub fn cleaned_rows(&self, count: u64) {
        counter!(self.name("cleaned_rows"), "node_id" => self.node_id.clone()).increment(count);
    }
}
