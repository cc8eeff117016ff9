//! Filesystem scanner.
//!
//! Walks every whitelist folder, pruning blacklist subtrees and surfacing
//! bundle-typed directories (`.app` and friends) as single opaque files.
//! Children of a directory are visited in lexicographic order; across
//! folders no ordering is promised. Output flows into a bounded channel —
//! when screening lags, the walk blocks rather than buffering unboundedly.

use chrono::{DateTime, Utc};
use mindex_core::error::{EngineResult, StoreResult};
use mindex_core::types::{FileCandidate, MonitoredFolder};
use rayon::prelude::*;
use std::path::Path;
use std::sync::mpsc::SyncSender;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::store::{path_has_prefix, Store};

// ---------------------------------------------------------------------------
// Scan events
// ---------------------------------------------------------------------------

/// What the scanner hands to screening: a live candidate or a removal.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Candidate(FileCandidate),
    Removed(String),
}

// ---------------------------------------------------------------------------
// Topology snapshot
// ---------------------------------------------------------------------------

/// Read-mostly snapshot of the monitor topology plus active bundle
/// extensions. Rebuilt on config-queue drain notifications.
#[derive(Debug, Clone, Default)]
pub struct ScanTopology {
    pub whitelists: Vec<MonitoredFolder>,
    pub blacklists: Vec<String>,
    pub bundle_extensions: Vec<String>,
}

impl ScanTopology {
    pub fn from_store(store: &Store) -> StoreResult<Self> {
        let folders = store.list_folders()?;
        let (black, white): (Vec<_>, Vec<_>) =
            folders.into_iter().partition(|f| f.is_blacklist);
        let bundle_extensions = store
            .list_bundle_extensions()?
            .into_iter()
            .filter(|b| b.is_active)
            .map(|b| b.extension)
            .collect();
        Ok(Self {
            whitelists: white,
            blacklists: black.into_iter().map(|f| f.path).collect(),
            bundle_extensions,
        })
    }

    /// A directory is pruned iff its path equals or descends from any
    /// blacklist path.
    pub fn is_blacklisted(&self, path: &str) -> bool {
        self.blacklists.iter().any(|b| path_has_prefix(path, b))
    }

    /// Bundle extension matching a directory name, if any.
    pub fn bundle_extension_of(&self, dir_name: &str) -> Option<&str> {
        let (_, ext) = dir_name.rsplit_once('.')?;
        let ext = ext.to_lowercase();
        self.bundle_extensions.iter().find(|b| **b == ext).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Candidate construction
// ---------------------------------------------------------------------------

fn mtime_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn candidate_for(path: &Path, meta: &std::fs::Metadata, is_bundle: bool) -> FileCandidate {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let extension = name.rsplit_once('.').map(|(_, e)| e.to_lowercase()).filter(|e| !e.is_empty());
    FileCandidate {
        path: path.to_string_lossy().to_string(),
        name,
        extension,
        size: meta.len(),
        mtime: mtime_of(meta),
        is_bundle,
    }
}

// ---------------------------------------------------------------------------
// Walking
// ---------------------------------------------------------------------------

/// Walk one whitelist root, streaming candidates into `tx`. Returns the
/// number of candidates emitted, or `Err` once the receiver is gone.
pub fn walk_root(
    root: &str,
    topology: &ScanTopology,
    tx: &SyncSender<ScanEvent>,
) -> Result<usize, ()> {
    let mut emitted = 0usize;
    let mut it = WalkDir::new(root).follow_links(false).sort_by_file_name().into_iter();

    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "Walk entry error, skipping");
                continue;
            }
        };
        let path = entry.path();
        let path_str = path.to_string_lossy();

        if entry.file_type().is_dir() {
            if path_str == root {
                continue;
            }
            if topology.is_blacklisted(&path_str) {
                it.skip_current_dir();
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy();
            if topology.bundle_extension_of(&dir_name).is_some() {
                // Opaque bundle: surface as a single file, never descend.
                if let Ok(meta) = entry.metadata() {
                    if tx.send(ScanEvent::Candidate(candidate_for(path, &meta, true))).is_err() {
                        return Err(());
                    }
                    emitted += 1;
                }
                it.skip_current_dir();
                continue;
            }
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                if tx.send(ScanEvent::Candidate(candidate_for(path, &meta, false))).is_err() {
                    return Err(());
                }
                emitted += 1;
            }
            Err(e) => debug!(path = %path.display(), error = %e, "Stat failed, skipping"),
        }
    }
    Ok(emitted)
}

/// Walk every whitelist root (parallel across roots, ordered within each).
/// Returns total candidates emitted.
pub fn sweep_all(
    topology: &ScanTopology,
    tx: &SyncSender<ScanEvent>,
) -> usize {
    topology
        .whitelists
        .par_iter()
        .map(|folder| {
            if !Path::new(&folder.path).is_dir() {
                warn!(path = folder.path.as_str(), "Whitelist folder missing on disk");
                return 0;
            }
            match walk_root(&folder.path, topology, tx) {
                Ok(n) => {
                    debug!(root = folder.path.as_str(), files = n, "Folder walk complete");
                    n
                }
                Err(()) => 0,
            }
        })
        .sum()
}

/// Re-stat a single path after a watcher notification and emit the matching
/// scan event. Paths inside blacklists or bundles are ignored.
pub fn rescan_path(
    path: &str,
    topology: &ScanTopology,
    tx: &SyncSender<ScanEvent>,
) -> EngineResult<()> {
    if topology.is_blacklisted(path) {
        return Ok(());
    }
    let owned = topology.whitelists.iter().any(|w| path_has_prefix(path, &w.path));
    if !owned {
        return Ok(());
    }

    let p = Path::new(path);
    match std::fs::metadata(p) {
        Ok(meta) if meta.is_file() => {
            let _ = tx.send(ScanEvent::Candidate(candidate_for(p, &meta, false)));
        }
        Ok(meta) if meta.is_dir() => {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if topology.bundle_extension_of(name).is_some() {
                let _ = tx.send(ScanEvent::Candidate(candidate_for(p, &meta, true)));
            }
        }
        Ok(_) => {}
        Err(_) => {
            let _ = tx.send(ScanEvent::Removed(path.to_string()));
        }
    }
    Ok(())
}

/// Run the initial bulk sweep and report completion exactly once through the
/// returned count. The caller flips the config queue to `ScanComplete`.
pub fn initial_sweep(store: &Store, tx: &SyncSender<ScanEvent>) -> StoreResult<usize> {
    let topology = ScanTopology::from_store(store)?;
    let total = sweep_all(&topology, tx);
    info!(files = total, roots = topology.whitelists.len(), "Initial sweep complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;

    fn topo(whitelist: &Path, blacklists: &[&Path], bundles: &[&str]) -> ScanTopology {
        ScanTopology {
            whitelists: vec![MonitoredFolder {
                id: 1,
                path: whitelist.to_string_lossy().to_string(),
                alias: None,
                is_blacklist: false,
                parent_id: None,
                is_common_folder: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }],
            blacklists: blacklists.iter().map(|p| p.to_string_lossy().to_string()).collect(),
            bundle_extensions: bundles.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn collect(topology: &ScanTopology) -> Vec<FileCandidate> {
        let (tx, rx) = mpsc::sync_channel(1024);
        sweep_all(topology, &tx);
        drop(tx);
        rx.into_iter()
            .filter_map(|e| match e {
                ScanEvent::Candidate(c) => Some(c),
                ScanEvent::Removed(_) => None,
            })
            .collect()
    }

    #[test]
    fn blacklist_subtree_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("readme.md"), "hello").unwrap();
        fs::write(root.join("draft.pdf"), "pdf").unwrap();
        fs::create_dir_all(root.join(".cache/deep")).unwrap();
        fs::write(root.join(".cache/junk.tmp"), "x").unwrap();
        fs::write(root.join(".cache/deep/more.tmp"), "x").unwrap();

        let cache = root.join(".cache");
        let topology = topo(root, &[cache.as_path()], &[]);
        let got = collect(&topology);

        let names: Vec<&str> = got.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"readme.md"));
        assert!(names.contains(&"draft.pdf"));
        assert!(!names.iter().any(|n| n.ends_with(".tmp")));
    }

    #[test]
    fn bundle_directory_is_one_opaque_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Paper.app/Contents/MacOS")).unwrap();
        fs::write(root.join("Paper.app/Contents/MacOS/paper"), "bin").unwrap();
        fs::write(root.join("notes.txt"), "n").unwrap();

        let topology = topo(root, &[], &["app"]);
        let got = collect(&topology);

        assert_eq!(got.len(), 2);
        let bundle = got.iter().find(|c| c.name == "Paper.app").unwrap();
        assert!(bundle.is_bundle);
        assert_eq!(bundle.extension.as_deref(), Some("app"));
        assert!(!got.iter().any(|c| c.name == "paper"), "bundle innards must not leak");
    }

    #[test]
    fn children_arrive_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for name in ["zeta.txt", "alpha.txt", "mid.txt"] {
            fs::write(root.join(name), "x").unwrap();
        }

        let topology = topo(root, &[], &[]);
        let names: Vec<String> = collect(&topology).into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["alpha.txt", "mid.txt", "zeta.txt"]);
    }

    #[test]
    fn rescan_reports_removal_for_vanished_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let topology = topo(root, &[], &[]);
        let (tx, rx) = mpsc::sync_channel(8);

        let gone = root.join("gone.txt");
        rescan_path(&gone.to_string_lossy(), &topology, &tx).unwrap();
        match rx.try_recv().unwrap() {
            ScanEvent::Removed(p) => assert_eq!(p, gone.to_string_lossy()),
            other => panic!("expected removal, got {other:?}"),
        }
    }

    #[test]
    fn rescan_ignores_unmonitored_paths() {
        let dir = tempfile::tempdir().unwrap();
        let topology = topo(dir.path(), &[], &[]);
        let (tx, rx) = mpsc::sync_channel(8);
        rescan_path("/somewhere/else.txt", &topology, &tx).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
