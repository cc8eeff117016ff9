//! Vectorization pipeline.
//!
//! A bounded worker pool drains a priority queue where interactive session
//! requests outrank batch pins. One non-terminal task per file (store
//! enforced); duplicate enqueues keep the oldest entry. Per task the stages
//! run `queued → parsing → chunking → vectorizing → completed | failed`,
//! with cooperative cancellation and a capability-generation check at every
//! stage boundary.
//!
//! Documents reach the chunker through the [`DocumentExtractor`] seam — the
//! engine ships a plain-text extractor and delegates everything else.

use mindex_core::chunking::{chunk_document, ChunkingLimits};
use mindex_core::config::{RetryPolicy, ScreeningConfig, VectorizeConfig};
use mindex_core::error::{codes, EngineError, EngineResult, ProviderError};
use mindex_core::types::*;
use serde_json::json;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::capability::{CapabilityRequest, CapabilityRouter};
use crate::events::{names, EventBus};
use crate::screening::content_hash_of;
use crate::store::{NewChunk, Store};
use crate::types::PathLocks;
use crate::vector_index::{VectorIndex, VectorRecord};

// ---------------------------------------------------------------------------
// Document extraction seam
// ---------------------------------------------------------------------------

/// An image pulled out of a document, ready for vision embedding.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub base64: String,
    /// Alt/caption text when the source format carries one.
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub text: String,
    pub images: Vec<ExtractedImage>,
}

/// Boundary to the external extractors. The engine never parses binary
/// document formats itself.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> EngineResult<ExtractedDocument>;
}

/// Built-in extractor: UTF-8 text files only. Binary content is an
/// unsupported format, a permanent failure.
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> EngineResult<ExtractedDocument> {
        let bytes = std::fs::read(path).map_err(|e| EngineError::Task {
            code: codes::MALFORMED_FILE,
            detail: format!("{}: {e}", path.display()),
        })?;
        let probe = &bytes[..bytes.len().min(8192)];
        if probe.contains(&0) {
            return Err(EngineError::Task {
                code: codes::UNSUPPORTED_FORMAT,
                detail: format!("{} is not text", path.display()),
            });
        }
        Ok(ExtractedDocument {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            images: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Priority queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Session-driven request; front of the queue.
    Interactive,
    /// Background pin.
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Job {
    priority: Priority,
    seq: u64,
    file_path: String,
    task_id: i64,
}

// BinaryHeap is a max-heap; invert so (Interactive, low seq) pops first.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct JobQueue {
    heap: BinaryHeap<Job>,
    stopped: bool,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct VectorizePipeline {
    store: Arc<Store>,
    bus: EventBus,
    router: Arc<CapabilityRouter>,
    index: Arc<VectorIndex>,
    extractor: Arc<dyn DocumentExtractor>,
    path_locks: Arc<PathLocks>,
    config: VectorizeConfig,
    screening: ScreeningConfig,
    retry: RetryPolicy,
    queue: Mutex<JobQueue>,
    queue_signal: Condvar,
    seq: AtomicU64,
    cancel_flags: dashmap::DashMap<String, Arc<AtomicBool>>,
}

impl VectorizePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        router: Arc<CapabilityRouter>,
        index: Arc<VectorIndex>,
        extractor: Arc<dyn DocumentExtractor>,
        path_locks: Arc<PathLocks>,
        config: VectorizeConfig,
        screening: ScreeningConfig,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            router,
            index,
            extractor,
            path_locks,
            config,
            screening,
            retry,
            queue: Mutex::new(JobQueue::default()),
            queue_signal: Condvar::new(),
            seq: AtomicU64::new(0),
            cancel_flags: dashmap::DashMap::new(),
        })
    }

    /// Spawn the worker pool. Workers exit when [`Self::shutdown`] runs.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<std::thread::JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|i| {
                let pipeline = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("vectorize-{i}"))
                    .spawn(move || pipeline.worker_loop())
                    .expect("spawn vectorize worker")
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        queue.stopped = true;
        self.queue_signal.notify_all();
    }

    /// Enqueue a screened file. Idempotent: an existing non-terminal task is
    /// returned as-is (duplicate enqueues keep the oldest queue entry).
    pub fn enqueue(&self, file_path: &str, priority: Priority) -> EngineResult<VectorizationTask> {
        let screening = self.store.get_screening(file_path)?.ok_or(EngineError::Rejected {
            reason: "not_screened",
            detail: format!("{file_path} has no screening row"),
        })?;
        if screening.status == ScreeningStatus::Deleted {
            return Err(EngineError::Rejected {
                reason: "deleted",
                detail: file_path.to_string(),
            });
        }

        let task = match self.store.create_task(file_path) {
            Ok(task) => task,
            Err(mindex_core::StoreError::Conflict(_)) => {
                // Oldest wins: the live task keeps its queue position.
                if let Some(task) = self.store.task_for_file(file_path)? {
                    if !task.status.is_terminal() {
                        return Ok(task);
                    }
                }
                return Err(EngineError::Rejected {
                    reason: "task_conflict",
                    detail: file_path.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if queue.heap.len() >= self.config.queue_capacity {
                self.store.update_task(
                    task.id,
                    TaskStatus::Failed,
                    TaskStage::Failed,
                    0,
                    None,
                    None,
                    Some("queue full"),
                )?;
                return Err(EngineError::Rejected {
                    reason: "queue_full",
                    detail: file_path.to_string(),
                });
            }
            queue.heap.push(Job {
                priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                file_path: file_path.to_string(),
                task_id: task.id,
            });
        }
        self.queue_signal.notify_one();
        self.bus.emit(
            names::MULTIVECTOR_STARTED,
            json!({ "file_path": file_path, "task_id": task.id }),
        );
        Ok(task)
    }

    /// Request cooperative cancellation; the worker notices at the next
    /// stage boundary.
    pub fn cancel(&self, file_path: &str) {
        if let Some(flag) = self.cancel_flags.get(file_path) {
            flag.store(true, Ordering::Release);
        }
    }

    fn worker_loop(&self) {
        loop {
            let job = {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                loop {
                    if queue.stopped {
                        return;
                    }
                    if let Some(job) = queue.heap.pop() {
                        break job;
                    }
                    queue = self
                        .queue_signal
                        .wait(queue)
                        .unwrap_or_else(|p| p.into_inner());
                }
            };

            let flag = Arc::new(AtomicBool::new(false));
            self.cancel_flags.insert(job.file_path.clone(), Arc::clone(&flag));
            let outcome = self.run_task(&job, &flag);
            self.cancel_flags.remove(&job.file_path);

            if let Err(e) = outcome {
                let (code, detail, retryable) = classify_failure(&e);
                if let Err(store_err) = self.store.update_task(
                    job.task_id,
                    TaskStatus::Failed,
                    TaskStage::Failed,
                    0,
                    None,
                    None,
                    Some(&format!("{code}: {detail}")),
                ) {
                    warn!(error = %store_err, "Task failure not persisted");
                }
                let mut payload = json!({
                    "file_path": job.file_path,
                    "task_id": job.task_id,
                    "code": code,
                    "error": detail,
                    "retryable": retryable,
                });
                if code == codes::MODEL_MISSING {
                    payload["help"] = json!(crate::capability::HELP_CAPABILITIES);
                }
                self.bus.emit(names::MULTIVECTOR_FAILED, payload);
            }
        }
    }

    fn check_boundary(
        &self,
        flag: &AtomicBool,
        generation: u64,
        started: Instant,
    ) -> EngineResult<()> {
        if flag.load(Ordering::Acquire) {
            return Err(EngineError::Task {
                code: codes::CANCELLED,
                detail: "cancelled by caller".into(),
            });
        }
        if self.router.generation() != generation {
            return Err(EngineError::Task {
                code: codes::CAPABILITY_REASSIGNED,
                detail: "capability binding changed mid-task".into(),
            });
        }
        if started.elapsed() > Duration::from_secs(self.retry.task_deadline_secs) {
            return Err(EngineError::Task {
                code: codes::DEADLINE_EXCEEDED,
                detail: "cumulative task deadline expired".into(),
            });
        }
        Ok(())
    }

    fn progress(&self, job: &Job, stage: TaskStage, progress: u8) -> EngineResult<()> {
        self.store.update_task(
            job.task_id,
            TaskStatus::Processing,
            stage,
            progress,
            None,
            None,
            None,
        )?;
        self.bus.emit(
            names::MULTIVECTOR_PROGRESS,
            json!({
                "file_path": job.file_path,
                "task_id": job.task_id,
                "stage": stage.as_str(),
                "progress": progress,
            }),
        );
        Ok(())
    }

    fn run_task(&self, job: &Job, flag: &AtomicBool) -> EngineResult<()> {
        let _path_guard = self.path_locks.lock(&job.file_path);
        let started = Instant::now();
        let generation = self.router.generation();
        let path = Path::new(&job.file_path);

        // -- parsing ---------------------------------------------------------
        self.check_boundary(flag, generation, started)?;
        self.progress(job, TaskStage::Parsing, 5)?;
        let document = self.extractor.extract(path)?;

        // Content-hash dedup: identical bytes reuse an existing chunk set.
        let screening = self.store.get_screening(&job.file_path)?;
        if let Some(row) = &screening {
            if row.size > self.screening.small_file_threshold {
                let hash = content_hash_of(path).map_err(|e| EngineError::Task {
                    code: codes::MALFORMED_FILE,
                    detail: e.to_string(),
                })?;
                self.store.set_content_hash(&job.file_path, &hash)?;
                if let Some(donor) = self
                    .store
                    .find_by_content_hash(&hash)?
                    .into_iter()
                    .find(|r| {
                        r.file_path != job.file_path && r.status == ScreeningStatus::Vectorized
                    })
                {
                    return self.complete_by_reuse(job, &donor.file_path);
                }
            }
        }

        // -- chunking --------------------------------------------------------
        self.check_boundary(flag, generation, started)?;
        self.progress(job, TaskStage::Chunking, 25)?;
        let limits = ChunkingLimits::new(
            self.config.parent_max_tokens,
            self.config.child_max_tokens,
            self.config.child_overlap_tokens,
        );
        let parents = chunk_document(&document.text, &limits);
        if parents.is_empty() && document.images.is_empty() {
            return Err(EngineError::Task {
                code: codes::MALFORMED_FILE,
                detail: "document produced no chunks".into(),
            });
        }

        let mut chunks: Vec<NewChunk> = Vec::new();
        // Embeddings parallel to the child chunks, in insertion order.
        let mut pending: Vec<(usize, Modality, String, Option<String>)> = Vec::new();
        for (parent_ordinal, parent) in parents.iter().enumerate() {
            chunks.push(NewChunk {
                tier: ChunkTier::Parent,
                parent_ordinal: None,
                ordinal: parent_ordinal as i64,
                text: Some(parent.text.clone()),
                modality: Modality::Text,
                token_count: parent.token_count as i64,
            });
        }
        let mut child_ordinal = 0i64;
        for (parent_ordinal, parent) in parents.iter().enumerate() {
            for child in &parent.children {
                pending.push((chunks.len(), Modality::Text, child.text.clone(), None));
                chunks.push(NewChunk {
                    tier: ChunkTier::Child,
                    parent_ordinal: Some(parent_ordinal as i64),
                    ordinal: child_ordinal,
                    text: Some(child.text.clone()),
                    modality: Modality::Text,
                    token_count: child.token_count as i64,
                });
                child_ordinal += 1;
            }
        }
        // Image children attach to the first parent (or a synthetic one for
        // image-only documents).
        if !document.images.is_empty() && parents.is_empty() {
            chunks.push(NewChunk {
                tier: ChunkTier::Parent,
                parent_ordinal: None,
                ordinal: 0,
                text: None,
                modality: Modality::Image,
                token_count: 0,
            });
        }
        for image in &document.images {
            pending.push((
                chunks.len(),
                Modality::Image,
                image.base64.clone(),
                image.caption.clone(),
            ));
            chunks.push(NewChunk {
                tier: ChunkTier::Child,
                parent_ordinal: Some(0),
                ordinal: child_ordinal,
                text: image.caption.clone(),
                modality: Modality::Image,
                token_count: image
                    .caption
                    .as_deref()
                    .map(mindex_core::chunking::estimate_tokens)
                    .unwrap_or(0) as i64,
            });
            child_ordinal += 1;
        }

        // -- vectorizing -----------------------------------------------------
        self.check_boundary(flag, generation, started)?;
        self.progress(job, TaskStage::Vectorizing, 40)?;

        let total = pending.len().max(1);
        let mut embeddings: Vec<(usize, Vec<f32>)> = Vec::with_capacity(pending.len());
        for (done, (chunk_slot, modality, content, caption)) in pending.iter().enumerate() {
            self.check_boundary(flag, generation, started)?;
            let request = match modality {
                Modality::Text => CapabilityRequest::EmbedText { text: content.clone() },
                Modality::Image => CapabilityRequest::EmbedImage {
                    image_base64: content.clone(),
                    caption: caption.clone(),
                },
            };
            let embedding = self.router.invoke_with_retry(&request)?.into_embedding()?;
            embeddings.push((*chunk_slot, embedding));
            let progress = 40 + ((done + 1) * 55 / total) as u8;
            self.progress(job, TaskStage::Vectorizing, progress.min(95))?;
        }

        // -- persist ---------------------------------------------------------
        self.check_boundary(flag, generation, started)?;
        let stale_ids: Vec<i64> =
            self.store.chunks_for_file(&job.file_path)?.iter().map(|c| c.id).collect();
        let rows = self.store.replace_chunk_set(&job.file_path, &chunks)?;
        if !stale_ids.is_empty() {
            self.index.remove(&stale_ids);
        }

        let mut records = Vec::with_capacity(embeddings.len());
        for (chunk_slot, embedding) in embeddings {
            let row = &rows[chunk_slot];
            records.push(VectorRecord {
                chunk_id: row.id,
                file_path: row.file_path.clone(),
                modality: row.modality,
                embedding,
            });
        }
        let parent_count = rows.iter().filter(|c| c.tier == ChunkTier::Parent).count() as i64;
        let child_count = rows.iter().filter(|c| c.tier == ChunkTier::Child).count() as i64;
        self.index.upsert(records)?;
        self.index.commit()?;

        self.store.set_screening_status(&job.file_path, ScreeningStatus::Vectorized)?;
        self.store.update_task(
            job.task_id,
            TaskStatus::Completed,
            TaskStage::Completed,
            100,
            Some(parent_count),
            Some(child_count),
            None,
        )?;
        self.bus.emit(
            names::MULTIVECTOR_COMPLETED,
            json!({
                "file_path": job.file_path,
                "task_id": job.task_id,
                "parent_count": parent_count,
                "child_count": child_count,
            }),
        );
        info!(
            file = job.file_path.as_str(),
            parents = parent_count,
            children = child_count,
            ms = started.elapsed().as_millis() as u64,
            "Vectorization complete"
        );
        Ok(())
    }

    /// Duplicate content: copy the donor's chunk set and embeddings.
    fn complete_by_reuse(&self, job: &Job, donor_path: &str) -> EngineResult<()> {
        debug!(file = job.file_path.as_str(), donor = donor_path, "Reusing embeddings");
        let pairs = self.store.copy_chunk_set(donor_path, &job.file_path)?;
        self.index.duplicate(&pairs, &job.file_path)?;
        self.index.commit()?;

        let rows = self.store.chunks_for_file(&job.file_path)?;
        let parent_count = rows.iter().filter(|c| c.tier == ChunkTier::Parent).count() as i64;
        let child_count = rows.iter().filter(|c| c.tier == ChunkTier::Child).count() as i64;
        self.store.set_screening_status(&job.file_path, ScreeningStatus::Vectorized)?;
        self.store.update_task(
            job.task_id,
            TaskStatus::Completed,
            TaskStage::Completed,
            100,
            Some(parent_count),
            Some(child_count),
            None,
        )?;
        self.bus.emit(
            names::MULTIVECTOR_COMPLETED,
            json!({
                "file_path": job.file_path,
                "task_id": job.task_id,
                "parent_count": parent_count,
                "child_count": child_count,
                "reused": true,
            }),
        );
        Ok(())
    }
}

/// Map a task error onto its stable failure code.
fn classify_failure(e: &EngineError) -> (&'static str, String, bool) {
    match e {
        EngineError::Task { code, detail } => {
            let retryable = *code == codes::CAPABILITY_REASSIGNED;
            (*code, detail.clone(), retryable)
        }
        EngineError::Provider(ProviderError::ModelMissing { .. }) => {
            (codes::MODEL_MISSING, e.to_string(), false)
        }
        EngineError::Provider(p) if p.is_retryable() => {
            (codes::RETRY_EXHAUSTED, e.to_string(), true)
        }
        EngineError::Provider(_) => (codes::MALFORMED_FILE, e.to_string(), false),
        other => (codes::RETRY_EXHAUSTED, other.to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_jobs_outrank_batch() {
        let mut heap = BinaryHeap::new();
        heap.push(Job { priority: Priority::Batch, seq: 0, file_path: "/b0".into(), task_id: 1 });
        heap.push(Job { priority: Priority::Batch, seq: 1, file_path: "/b1".into(), task_id: 2 });
        heap.push(Job {
            priority: Priority::Interactive,
            seq: 2,
            file_path: "/i0".into(),
            task_id: 3,
        });

        assert_eq!(heap.pop().unwrap().file_path, "/i0");
        assert_eq!(heap.pop().unwrap().file_path, "/b0");
        assert_eq!(heap.pop().unwrap().file_path, "/b1");
    }

    #[test]
    fn fifo_within_one_priority() {
        let mut heap = BinaryHeap::new();
        for seq in 0..5u64 {
            heap.push(Job {
                priority: Priority::Batch,
                seq,
                file_path: format!("/f{seq}"),
                task_id: seq as i64,
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|j| j.file_path)).collect();
        assert_eq!(order, vec!["/f0", "/f1", "/f2", "/f3", "/f4"]);
    }

    #[test]
    fn plain_text_extractor_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("blob.bin");
        std::fs::write(&bin, [0u8, 1, 2, 3]).unwrap();
        let err = PlainTextExtractor.extract(&bin).unwrap_err();
        match err {
            EngineError::Task { code, .. } => assert_eq!(code, codes::UNSUPPORTED_FORMAT),
            other => panic!("unexpected: {other:?}"),
        }

        let text = dir.path().join("note.md");
        std::fs::write(&text, "# heading\n\nbody").unwrap();
        let doc = PlainTextExtractor.extract(&text).unwrap();
        assert!(doc.text.contains("heading"));
    }

    #[test]
    fn failure_classification_is_stable() {
        let cancelled = EngineError::Task { code: codes::CANCELLED, detail: "x".into() };
        assert_eq!(classify_failure(&cancelled).0, codes::CANCELLED);

        let missing = EngineError::Provider(ProviderError::ModelMissing { capability: "text" });
        let (code, _, retryable) = classify_failure(&missing);
        assert_eq!(code, codes::MODEL_MISSING);
        assert!(!retryable);

        let flaky = EngineError::Provider(ProviderError::RateLimited);
        assert!(classify_failure(&flaky).2);
    }
}
