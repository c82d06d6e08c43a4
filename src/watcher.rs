// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database file watcher.
//!
//! Local commits touch the database file or its WAL siblings; the watcher
//! turns those filesystem notifications into wake signals for the change
//! scanner. A periodic poll provides a floor under platforms or mounts
//! where notifications are unreliable, and doubles as the retry point for
//! watch registrations on journal files that do not exist yet.
//!
//! Wake signals are coalesced through a bounded channel: the scanner
//! serializes drain cycles anyway, so a burst of notifications collapses
//! into at most one queued wake.

use crate::error::{MarmotError, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Wake-signal source for the change scanner.
pub struct ChangeWatcher {
    rx: mpsc::Receiver<()>,
}

impl ChangeWatcher {
    /// Watch a database file and its `-wal` / `-shm` siblings, with a
    /// polling floor of `poll_interval`.
    pub fn spawn(
        db_path: &str,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (fs_tx, fs_rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if is_content_event(&event) => {
                    let _ = fs_tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        })
        .map_err(|e| MarmotError::Config(format!("file watcher: {}", e)))?;

        let paths = vec![
            PathBuf::from(db_path),
            PathBuf::from(format!("{}-wal", db_path)),
            PathBuf::from(format!("{}-shm", db_path)),
        ];

        tokio::spawn(watch_loop(
            watcher,
            paths,
            poll_interval,
            fs_rx,
            wake_tx,
            shutdown,
        ));

        Ok(Self { rx: wake_rx })
    }

    /// Wait for the next wake signal; `None` once the watcher shut down.
    pub async fn wake(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

async fn watch_loop(
    mut watcher: RecommendedWatcher,
    paths: Vec<PathBuf>,
    poll_interval: Duration,
    mut fs_rx: mpsc::UnboundedReceiver<()>,
    wake_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut registered = vec![false; paths.len()];
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        // Journal siblings appear lazily; retry their registration until
        // the watch sticks.
        for (path, registered) in paths.iter().zip(registered.iter_mut()) {
            if !*registered {
                match watcher.watch(path, RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        debug!(path = %path.display(), "Watching file");
                        *registered = true;
                    }
                    Err(_) => {}
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("File watcher stopping");
                    return;
                }
            }
            signal = fs_rx.recv() => {
                if signal.is_none() {
                    return;
                }
                let _ = wake_tx.try_send(());
            }
            _ = ticker.tick() => {
                let _ = wake_tx.try_send(());
            }
        }
    }
}

/// Filter out notifications that cannot reflect a committed write:
/// access events and metadata-only (mode/ownership) changes.
fn is_content_event(event: &notify::Event) -> bool {
    !matches!(
        event.kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

/// Watchable sibling paths of a database file.
pub fn sibling_paths(db_path: &str) -> Vec<String> {
    vec![
        db_path.to_string(),
        format!("{}-wal", db_path),
        format!("{}-shm", db_path),
    ]
}
