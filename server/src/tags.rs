//! Tag engine — system-derived and LLM-derived file tags.
//!
//! System tags are deterministic and cheap: category name, extension, and
//! the modification year. LLM tags come from the `structured_output`
//! capability over a bounded excerpt. A missing capability assignment
//! raises `tagging-model-missing` once and suspends LLM tagging until the
//! assignment returns; system tags keep flowing.
//!
//! Tag weights live in the store; the tag-cloud view is recomputed on the
//! debounced `tags-updated` stream, not per membership change.

use chrono::Datelike;
use mindex_core::config::{ScreeningConfig, TaggingConfig};
use mindex_core::error::{EngineResult, ProviderError};
use mindex_core::types::*;
use serde_json::json;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capability::{CapabilityRequest, CapabilityRouter, HELP_CAPABILITIES};
use crate::events::{names, EventBus};
use crate::screening::content_hash_of;
use crate::store::Store;
use crate::types::PathLocks;

const MAX_LLM_TAGS: usize = 8;

pub struct TagEngine {
    store: Arc<Store>,
    bus: EventBus,
    router: Arc<CapabilityRouter>,
    path_locks: Arc<PathLocks>,
    config: TaggingConfig,
    screening: ScreeningConfig,
    /// Set while no structured-output binding exists. The missing-model
    /// event fires once per suspension, not per file.
    llm_suspended: AtomicBool,
    cloud: RwLock<Vec<Tag>>,
}

impl TagEngine {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        router: Arc<CapabilityRouter>,
        path_locks: Arc<PathLocks>,
        config: TaggingConfig,
        screening: ScreeningConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            router,
            path_locks,
            config,
            screening,
            llm_suspended: AtomicBool::new(false),
            cloud: RwLock::new(Vec::new()),
        })
    }

    /// Spawn the tagging worker pool over one shared receiver.
    pub fn spawn_workers(
        self: &Arc<Self>,
        rx: Receiver<ScreeningResult>,
    ) -> Vec<std::thread::JoinHandle<()>> {
        let shared = Arc::new(Mutex::new(rx));
        (0..self.config.workers.max(1))
            .map(|i| {
                let engine = Arc::clone(self);
                let rx = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("tagging-{i}"))
                    .spawn(move || loop {
                        let row = {
                            let guard = rx.lock().unwrap_or_else(|p| p.into_inner());
                            guard.recv()
                        };
                        match row {
                            Ok(row) => {
                                if let Err(e) = engine.process(&row) {
                                    warn!(file = row.file_path.as_str(), error = %e, "Tagging failed");
                                }
                            }
                            Err(_) => break,
                        }
                    })
                    .expect("spawn tagging worker")
            })
            .collect()
    }

    /// Re-enable LLM tagging after an assignment returns.
    pub fn resume_llm(&self) {
        if self.llm_suspended.swap(false, Ordering::AcqRel) {
            info!("LLM tagging resumed");
        }
    }

    /// Refresh the materialized tag cloud. Driven by the debounced
    /// `tags-updated` stream.
    pub fn refresh_cloud(&self) -> EngineResult<Vec<Tag>> {
        self.store.recount_tag_weights()?;
        let cloud = self.store.tag_cloud(100)?;
        *self.cloud.write().unwrap_or_else(|p| p.into_inner()) = cloud.clone();
        Ok(cloud)
    }

    pub fn cloud(&self) -> Vec<Tag> {
        self.cloud.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Subscribe the cloud refresher to the bus. One background thread.
    pub fn spawn_cloud_refresher(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let engine = Arc::clone(self);
        let sub = self.bus.subscribe(Some(names::TAGS_UPDATED));
        std::thread::Builder::new()
            .name("tag-cloud".into())
            .spawn(move || {
                for _event in sub.rx.iter() {
                    if let Err(e) = engine.refresh_cloud() {
                        warn!(error = %e, "Tag cloud refresh failed");
                    }
                }
            })
            .expect("spawn tag cloud refresher")
    }

    // -----------------------------------------------------------------------
    // Per-file tagging
    // -----------------------------------------------------------------------

    pub fn process(&self, row: &ScreeningResult) -> EngineResult<()> {
        let _guard = self.path_locks.lock(&row.file_path);

        // The row may have moved on (deleted, re-screened) while queued.
        let Some(current) = self.store.get_screening(&row.file_path)? else {
            return Ok(());
        };
        if current.status == ScreeningStatus::Deleted {
            return Ok(());
        }

        let mut applied: Vec<String> = Vec::new();
        for name in self.system_tags(&current) {
            let tag = self.store.ensure_tag(&name, TagKind::System)?;
            self.store.attach_tag(current.id, tag.id)?;
            applied.push(name);
        }

        // Lazy fingerprint: first full read of the file happens here.
        if current.content_hash.is_none() && current.size > self.screening.small_file_threshold {
            match content_hash_of(Path::new(&current.file_path)) {
                Ok(hash) => self.store.set_content_hash(&current.file_path, &hash)?,
                Err(e) => debug!(file = current.file_path.as_str(), error = %e, "Hash skipped"),
            }
        }

        match self.llm_tags(&current) {
            Ok(tags) => {
                for name in tags {
                    let tag = self.store.ensure_tag(&name, TagKind::Llm)?;
                    self.store.attach_tag(current.id, tag.id)?;
                    applied.push(name);
                }
            }
            Err(ProviderError::ModelMissing { capability }) => {
                if !self.llm_suspended.swap(true, Ordering::AcqRel) {
                    self.bus.emit(
                        names::TAGGING_MODEL_MISSING,
                        json!({ "capability": capability, "help": HELP_CAPABILITIES }),
                    );
                    info!("LLM tagging suspended: no structured_output assignment");
                }
            }
            Err(e) => {
                warn!(file = current.file_path.as_str(), error = %e, "LLM tagging failed");
            }
        }

        if current.status == ScreeningStatus::New {
            self.store.set_screening_status(&current.file_path, ScreeningStatus::Tagged)?;
        }

        self.bus.emit(
            names::FILE_TAGGING_PROGRESS,
            json!({ "file_path": current.file_path, "tags": applied }),
        );
        self.bus.emit(names::TAGS_UPDATED, json!({ "file_path": current.file_path }));
        Ok(())
    }

    /// Deterministic tags from metadata alone.
    fn system_tags(&self, row: &ScreeningResult) -> Vec<String> {
        let mut tags = Vec::with_capacity(3);
        if let Some(category_id) = row.category_id {
            if let Ok(category) = self.store.get_category(category_id) {
                tags.push(category.name);
            }
        }
        if let Some(ext) = &row.extension {
            tags.push(ext.clone());
        }
        tags.push(row.modified_time.year().to_string());
        tags
    }

    /// Structured-output tags over a bounded excerpt. Suspension short-cuts
    /// before any file I/O.
    fn llm_tags(&self, row: &ScreeningResult) -> Result<Vec<String>, ProviderError> {
        if self.llm_suspended.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let excerpt = match read_excerpt(Path::new(&row.file_path), self.config.excerpt_bytes) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => return Ok(Vec::new()),
        };
        let request = CapabilityRequest::StructuredTags { excerpt, max_tags: MAX_LLM_TAGS };
        let tags = self.router.invoke_with_retry(&request)?.into_tags()?;
        Ok(tags.into_iter().take(MAX_LLM_TAGS).collect())
    }
}

/// Read at most `max_bytes` of UTF-8-ish text from the head of a file.
fn read_excerpt(path: &Path, max_bytes: usize) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut buf = Vec::with_capacity(max_bytes.min(64 * 1024));
    file.take(max_bytes as u64).read_to_end(&mut buf)?;
    if buf[..buf.len().min(4096)].contains(&0) {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use chrono::{TimeZone, Utc};
    use mindex_core::config::{EventBusConfig, ProviderNetConfig, RetryPolicy};

    struct Harness {
        engine: Arc<TagEngine>,
        store: Arc<Store>,
        sink: MemorySink,
        _dir: tempfile::TempDir,
        dir_path: std::path::PathBuf,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(
            EventBusConfig { debounce_ms: 10, ..Default::default() },
            Box::new(sink.clone()),
        );
        let router = Arc::new(CapabilityRouter::new(
            Arc::clone(&store),
            bus.clone(),
            &ProviderNetConfig::default(),
            RetryPolicy { max_attempts: 1, base_delay_ms: 1, factor: 2, task_deadline_secs: 5 },
        ));
        let engine = TagEngine::new(
            Arc::clone(&store),
            bus,
            router,
            Arc::new(PathLocks::default()),
            TaggingConfig::default(),
            ScreeningConfig::default(),
        );
        let dir_path = dir.path().to_path_buf();
        Harness { engine, store, sink, _dir: dir, dir_path }
    }

    fn screened(h: &Harness, name: &str, content: &str) -> ScreeningResult {
        let path = h.dir_path.join(name);
        std::fs::write(&path, content).unwrap();
        let candidate = FileCandidate {
            path: path.to_string_lossy().to_string(),
            name: name.to_string(),
            extension: name.rsplit_once('.').map(|(_, e)| e.to_lowercase()),
            size: content.len() as u64,
            mtime: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            is_bundle: false,
        };
        let category = h.store.upsert_category("document", None, None).unwrap();
        let (_, row) = h.store.upsert_screening(&candidate, Some(category.id)).unwrap();
        row
    }

    #[test]
    fn system_tags_cover_category_extension_year() {
        let h = harness();
        let row = screened(&h, "notes.md", "hello");
        h.engine.process(&row).unwrap();

        let tags: Vec<String> =
            h.store.tags_for_file(row.id).unwrap().into_iter().map(|t| t.name).collect();
        assert!(tags.contains(&"document".to_string()));
        assert!(tags.contains(&"md".to_string()));
        assert!(tags.contains(&"2025".to_string()));
    }

    #[test]
    fn missing_capability_emits_once_and_system_tags_continue() {
        let h = harness();
        let a = screened(&h, "a.md", "alpha");
        let b = screened(&h, "b.md", "beta");
        h.engine.process(&a).unwrap();
        h.engine.process(&b).unwrap();
        h.engine.bus_sync();

        let missing = h
            .sink
            .frames()
            .into_iter()
            .filter(|f| f.event == names::TAGGING_MODEL_MISSING)
            .count();
        assert_eq!(missing, 1, "tagging-model-missing fires once per suspension");

        // System tags were still created for both files.
        assert!(!h.store.tags_for_file(a.id).unwrap().is_empty());
        assert!(!h.store.tags_for_file(b.id).unwrap().is_empty());
    }

    #[test]
    fn status_advances_new_to_tagged_without_downgrades() {
        let h = harness();
        let row = screened(&h, "c.md", "gamma");
        h.engine.process(&row).unwrap();
        let after = h.store.get_screening(&row.file_path).unwrap().unwrap();
        assert_eq!(after.status, ScreeningStatus::Tagged);

        h.store.set_screening_status(&row.file_path, ScreeningStatus::Vectorized).unwrap();
        let fresh = h.store.get_screening(&row.file_path).unwrap().unwrap();
        h.engine.process(&fresh).unwrap();
        let still = h.store.get_screening(&row.file_path).unwrap().unwrap();
        assert_eq!(still.status, ScreeningStatus::Vectorized);
    }

    #[test]
    fn cloud_refresh_materializes_weights() {
        let h = harness();
        let row = screened(&h, "d.md", "delta");
        h.engine.process(&row).unwrap();

        let cloud = h.engine.refresh_cloud().unwrap();
        assert!(!cloud.is_empty());
        assert!(cloud.iter().all(|t| t.weight > 0));
        assert_eq!(h.engine.cloud().len(), cloud.len());
    }

    impl TagEngine {
        fn bus_sync(&self) {
            self.bus.sync();
        }
    }
}
