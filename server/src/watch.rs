//! File watcher for incremental re-screening.
//!
//! Watches every whitelist root and feeds debounced change notifications
//! back through [`crate::scan::rescan_path`]. The watcher is best-effort: if
//! it cannot be created (or dies), the engine falls back to periodic
//! re-walks at a lower cadence.

use mindex_core::config::ScannerConfig;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::scan::{rescan_path, sweep_all, ScanEvent, ScanTopology};

/// Handle keeping the watcher (or its fallback) alive.
pub struct WatchHandle {
    watcher: Option<RecommendedWatcher>,
}

impl WatchHandle {
    pub fn is_native(&self) -> bool {
        self.watcher.is_some()
    }

    /// Point the native watcher at the current whitelist roots. Called after
    /// a config-queue drain changes the topology.
    pub fn refresh_roots(&mut self, topology: &ScanTopology) {
        let Some(watcher) = self.watcher.as_mut() else { return };
        for folder in &topology.whitelists {
            let path = PathBuf::from(&folder.path);
            if let Err(e) = watcher.watch(&path, RecursiveMode::Recursive) {
                debug!(path = folder.path.as_str(), error = %e, "Watch registration failed");
            }
        }
    }
}

/// Start the OS watcher over every whitelist root. On failure, spawns the
/// periodic-rescan fallback instead and returns a handle without a watcher.
pub fn start_watcher(
    topology: Arc<RwLock<ScanTopology>>,
    tx: SyncSender<ScanEvent>,
    config: ScannerConfig,
) -> WatchHandle {
    let (event_tx, event_rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "OS watcher unavailable; falling back to periodic re-walks");
            spawn_fallback_rescan(topology, tx, config);
            return WatchHandle { watcher: None };
        }
    };

    {
        let topo = topology.read().unwrap_or_else(|p| p.into_inner());
        for folder in &topo.whitelists {
            match watcher.watch(&PathBuf::from(&folder.path), RecursiveMode::Recursive) {
                Ok(()) => info!(path = folder.path.as_str(), "Watching"),
                Err(e) => warn!(path = folder.path.as_str(), error = %e, "Watch failed"),
            }
        }
    }

    let debounce = Duration::from_millis(config.watch_debounce_ms);
    std::thread::Builder::new()
        .name("watch-debounce".into())
        .spawn(move || debounce_loop(event_rx, topology, tx, debounce))
        .expect("spawn watch debounce thread");

    WatchHandle { watcher: Some(watcher) }
}

/// Collect watcher events and process them after a quiet period.
fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    topology: Arc<RwLock<ScanTopology>>,
    tx: SyncSender<ScanEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        match rx.recv_timeout(debounce) {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                );
                if relevant {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - debounce;
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, t)| **t <= cutoff)
                    .map(|(p, _)| p.clone())
                    .collect();
                if ready.is_empty() {
                    continue;
                }

                let topo = topology.read().unwrap_or_else(|p| p.into_inner()).clone();
                for path in ready {
                    pending.remove(&path);
                    let path_str = path.to_string_lossy();
                    if let Err(e) = rescan_path(&path_str, &topo, &tx) {
                        debug!(path = %path.display(), error = %e, "Rescan failed");
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Low-cadence full re-walk loop used when no OS watcher exists.
fn spawn_fallback_rescan(
    topology: Arc<RwLock<ScanTopology>>,
    tx: SyncSender<ScanEvent>,
    config: ScannerConfig,
) {
    let cadence = Duration::from_secs(config.fallback_rescan_secs.max(30));
    std::thread::Builder::new()
        .name("fallback-rescan".into())
        .spawn(move || loop {
            std::thread::sleep(cadence);
            let topo = topology.read().unwrap_or_else(|p| p.into_inner()).clone();
            let emitted = sweep_all(&topo, &tx);
            debug!(files = emitted, "Fallback re-walk finished");
        })
        .expect("spawn fallback rescan thread");
}
