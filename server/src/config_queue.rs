//! Deferred-mutation queue for monitor topology.
//!
//! While the initial bulk scan runs (`ScanPending`), every topology change —
//! folder added, removed, toggled — is appended to a persisted log and
//! acknowledged as `queued`. On scan completion the log drains in FIFO
//! order; from then on (`ScanComplete`) mutations execute inline, after
//! first draining anything still queued.
//!
//! Every applied change emits `database-updated` with the change kind so
//! derived caches (scanner topology, screening rule cache) rebuild, and so
//! the screening pipeline can prune subtrees on folder deletion.

use crate::events::{names, EventBus};
use crate::store::Store;
use mindex_core::error::{EngineResult, StoreError};
use mindex_core::types::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    ScanPending,
    ScanComplete,
}

/// What a topology mutation call returned to its caller.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    /// Deferred; will apply on drain.
    Queued(ConfigChange),
    /// Applied inline; payload describes the result.
    Executed(Value),
}

impl MutationOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            MutationOutcome::Queued(_) => "queued",
            MutationOutcome::Executed(_) => "executed",
        }
    }
}

pub struct ConfigQueue {
    store: Arc<Store>,
    bus: EventBus,
    state: Mutex<ScanState>,
}

impl ConfigQueue {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self { store, bus, state: Mutex::new(ScanState::ScanPending) }
    }

    pub fn scan_state(&self) -> ScanState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_scan_complete(&self) -> bool {
        self.scan_state() == ScanState::ScanComplete
    }

    // -----------------------------------------------------------------------
    // Public mutations
    // -----------------------------------------------------------------------

    pub fn add_whitelist(&self, path: &str, alias: Option<&str>) -> EngineResult<MutationOutcome> {
        self.mutate(ConfigChangeKind::AddWhite, json!({ "path": path, "alias": alias }))
    }

    pub fn add_blacklist(&self, path: &str, alias: Option<&str>) -> EngineResult<MutationOutcome> {
        self.mutate(ConfigChangeKind::AddBlack, json!({ "path": path, "alias": alias }))
    }

    pub fn delete_folder(&self, path: &str) -> EngineResult<MutationOutcome> {
        self.mutate(ConfigChangeKind::DeleteFolder, json!({ "path": path }))
    }

    pub fn toggle_folder(&self, path: &str) -> EngineResult<MutationOutcome> {
        self.mutate(ConfigChangeKind::ToggleStatus, json!({ "path": path }))
    }

    /// Flip to `ScanComplete` and drain the queue. Called exactly once by the
    /// scanner when the initial sweep finishes; idempotent afterwards.
    pub fn mark_scan_complete(&self) -> EngineResult<usize> {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state == ScanState::ScanComplete {
                return self.drain();
            }
            *state = ScanState::ScanComplete;
        }
        let applied = self.drain()?;
        info!(applied, "Config queue drained on scan completion");
        Ok(applied)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn mutate(&self, kind: ConfigChangeKind, payload: Value) -> EngineResult<MutationOutcome> {
        let state = self.scan_state();
        if state == ScanState::ScanPending {
            let change = self.store.enqueue_change(kind, &payload)?;
            return Ok(MutationOutcome::Queued(change));
        }

        // Inline path: queued items (if any) drain first, in order.
        self.drain()?;
        let result = self.apply(kind, &payload)?;
        self.notify(kind, &payload, &result);
        Ok(MutationOutcome::Executed(result))
    }

    /// Drain pending changes FIFO. A failed item is logged, marked, and the
    /// drain continues. Returns the number applied successfully.
    fn drain(&self) -> EngineResult<usize> {
        let pending = self.store.pending_changes()?;
        let mut applied = 0usize;
        for change in pending {
            match self.apply(change.kind, &change.payload) {
                Ok(result) => {
                    self.store.mark_change_executed(change.id, false)?;
                    self.notify(change.kind, &change.payload, &result);
                    applied += 1;
                }
                Err(e) => {
                    warn!(
                        id = change.id,
                        kind = change.kind.as_str(),
                        error = %e,
                        "Queued topology change failed; continuing drain"
                    );
                    self.store.mark_change_executed(change.id, true)?;
                }
            }
        }
        Ok(applied)
    }

    /// Apply one change against the store. Pure topology — event emission is
    /// the caller's job so drain and inline paths stay symmetric.
    fn apply(&self, kind: ConfigChangeKind, payload: &Value) -> EngineResult<Value> {
        let path = payload["path"]
            .as_str()
            .ok_or_else(|| StoreError::InvalidInput("change payload missing path".into()))?;
        let alias = payload["alias"].as_str();

        match kind {
            ConfigChangeKind::AddWhite => {
                let folder = self.store.add_folder(path, alias, false, false)?;
                Ok(json!({ "folder": folder }))
            }
            ConfigChangeKind::AddBlack => {
                let folder = self.store.add_folder(path, alias, true, false)?;
                Ok(json!({ "folder": folder }))
            }
            ConfigChangeKind::DeleteFolder => {
                let folder = self
                    .store
                    .get_folder_by_path(path)?
                    .ok_or_else(|| StoreError::NotFound(format!("folder {path}")))?;
                let removed = self.store.delete_folder_cascade(folder.id)?;
                let stale = if !folder.is_blacklist {
                    self.store.mark_under_prefix(path, ScreeningStatus::Stale)?
                } else {
                    Vec::new()
                };
                Ok(json!({ "removed": removed, "stale_paths": stale }))
            }
            ConfigChangeKind::ToggleStatus => {
                let folder = self
                    .store
                    .get_folder_by_path(path)?
                    .ok_or_else(|| StoreError::NotFound(format!("folder {path}")))?;
                let toggled = self.store.toggle_folder(folder.id)?;
                let stale = if toggled.is_blacklist {
                    self.store.mark_under_prefix(path, ScreeningStatus::Stale)?
                } else {
                    Vec::new()
                };
                Ok(json!({ "folder": toggled, "stale_paths": stale }))
            }
        }
    }

    /// One `database-updated` per applied change; consumers rebuild derived
    /// indices and prune stale subtrees from the attached paths.
    fn notify(&self, kind: ConfigChangeKind, payload: &Value, result: &Value) {
        self.bus.emit(
            names::DATABASE_UPDATED,
            json!({
                "kind": kind.as_str(),
                "path": payload["path"],
                "stale_paths": result.get("stale_paths").cloned().unwrap_or(Value::Null),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use mindex_core::config::EventBusConfig;

    fn queue() -> (ConfigQueue, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus =
            EventBus::with_sink(EventBusConfig::default(), Box::new(MemorySink::new()));
        (ConfigQueue::new(Arc::clone(&store), bus), store)
    }

    #[test]
    fn mutations_queue_while_scan_pending() {
        let (q, store) = queue();
        let out = q.add_whitelist("/a", None).unwrap();
        assert_eq!(out.status(), "queued");
        assert!(store.list_folders().unwrap().is_empty());
        assert_eq!(store.pending_changes().unwrap().len(), 1);
    }

    #[test]
    fn drain_matches_inline_application() {
        // Same change sequence, once queued-then-drained and once inline,
        // must land on identical final folder state.
        let sequence: &[(&str, ConfigChangeKind)] = &[
            ("/a", ConfigChangeKind::AddWhite),
            ("/a/secret", ConfigChangeKind::AddBlack),
            ("/b", ConfigChangeKind::AddWhite),
            ("/b", ConfigChangeKind::ToggleStatus),
        ];

        let (queued, queued_store) = queue();
        for (path, kind) in sequence {
            match kind {
                ConfigChangeKind::AddWhite => queued.add_whitelist(path, None).unwrap(),
                ConfigChangeKind::AddBlack => queued.add_blacklist(path, None).unwrap(),
                ConfigChangeKind::DeleteFolder => queued.delete_folder(path).unwrap(),
                ConfigChangeKind::ToggleStatus => queued.toggle_folder(path).unwrap(),
            };
        }
        queued.mark_scan_complete().unwrap();

        let (inline, inline_store) = queue();
        inline.mark_scan_complete().unwrap();
        for (path, kind) in sequence {
            match kind {
                ConfigChangeKind::AddWhite => inline.add_whitelist(path, None).unwrap(),
                ConfigChangeKind::AddBlack => inline.add_blacklist(path, None).unwrap(),
                ConfigChangeKind::DeleteFolder => inline.delete_folder(path).unwrap(),
                ConfigChangeKind::ToggleStatus => inline.toggle_folder(path).unwrap(),
            };
        }

        let summarize = |store: &Store| -> Vec<(String, bool, bool)> {
            store
                .list_folders()
                .unwrap()
                .into_iter()
                .map(|f| (f.path, f.is_blacklist, f.is_common_folder))
                .collect()
        };
        assert_eq!(summarize(&queued_store), summarize(&inline_store));
    }

    #[test]
    fn failed_drain_item_does_not_stop_the_drain() {
        let (q, store) = queue();
        q.delete_folder("/missing").unwrap(); // will fail at apply time
        q.add_whitelist("/a", None).unwrap();
        let applied = q.mark_scan_complete().unwrap();
        assert_eq!(applied, 1);

        let folders = store.list_folders().unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].path, "/a");

        // The failed item is recorded, not retried forever.
        assert!(store.pending_changes().unwrap().is_empty());
    }

    #[test]
    fn scenario_queue_flush_leaves_no_active_folders() {
        // add /A, blacklist /A/secret, toggle /A to blacklist, delete /A.
        let (q, store) = queue();
        q.add_whitelist("/A", None).unwrap();
        q.add_blacklist("/A/secret", None).unwrap();
        q.toggle_folder("/A").unwrap();
        q.delete_folder("/A").unwrap();
        q.mark_scan_complete().unwrap();

        assert!(store.list_folders().unwrap().is_empty());
        assert!(q.is_scan_complete());
    }

    #[test]
    fn inline_mutation_executes_and_reports() {
        let (q, store) = queue();
        q.mark_scan_complete().unwrap();
        let out = q.add_whitelist("/docs", None).unwrap();
        assert_eq!(out.status(), "executed");
        assert_eq!(store.list_folders().unwrap().len(), 1);
    }
}
