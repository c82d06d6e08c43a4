// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `marmot` binary: CLI parsing, logging, and run-mode dispatch.

use clap::Parser;
use marmot::config::Config;
use marmot::db::StreamDb;
use marmot::engine::Engine;
use marmot::error::Result;
use marmot::telemetry::Telemetry;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "marmot")]
#[command(about = "Leaderless multi-writer replication for SQLite")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Only cleanup marmot triggers and changelogs, then exit
    #[arg(long)]
    cleanup: bool,

    /// Only take a snapshot and upload it, then exit
    #[arg(long = "save-snapshot")]
    save_snapshot: bool,

    /// Cluster listening address (embedded fabric deployments)
    #[arg(long = "cluster-addr")]
    cluster_addr: Option<String>,

    /// Comma separated list of cluster peer URLs
    #[arg(long = "cluster-peers")]
    cluster_peers: Option<String>,

    /// Comma separated list of leaf servers
    #[arg(long = "leaf-servers")]
    leaf_servers: Option<String>,

    /// Profiler endpoint address
    #[arg(long)]
    pprof: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref().unwrap_or_default()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("marmot: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&cfg);

    if let Err(e) = run(cli, cfg).await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

fn init_logging(cfg: &Config) {
    let level = if cfg.logging.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    if cfg.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    let telemetry = Telemetry::init(&cfg.prometheus, cfg.node_id)?;
    info!(node_id = cfg.node_id, db_path = %cfg.db_path, "Starting marmot");

    if let Some(addr) = &cli.pprof {
        warn!(addr = %addr, "Profiler endpoint is not available in this build");
    }
    if cli.cluster_addr.is_some() || cli.cluster_peers.is_some() || cli.leaf_servers.is_some() {
        info!(
            cluster_addr = cli.cluster_addr.as_deref().unwrap_or_default(),
            cluster_peers = cli.cluster_peers.as_deref().unwrap_or_default(),
            leaf_servers = cli.leaf_servers.as_deref().unwrap_or_default(),
            "Cluster flags noted; the fabric itself is managed externally"
        );
    }

    if cli.cleanup {
        let db = StreamDb::open(&cfg.db_path, telemetry).await?;
        db.remove_cdc(true).await?;
        info!("Cleanup complete");
        return Ok(());
    }

    let engine = Engine::bootstrap(cfg, telemetry).await?;

    if cli.save_snapshot {
        engine.replicator().save_snapshot().await?;
        return Ok(());
    }

    engine.run().await
}
