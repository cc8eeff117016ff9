//! Engine assembly — one context owning every subsystem, passed explicitly
//! to whoever needs it. Tests build a fresh engine per case; nothing global.

use mindex_core::config::EngineConfig;
use mindex_core::error::{EngineError, EngineResult};
use serde_json::json;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::capability::CapabilityRouter;
use crate::config_queue::ConfigQueue;
use crate::events::{names, EventBus};
use crate::models::ModelDownloader;
use crate::retrieval::Retrieval;
use crate::scan::{initial_sweep, ScanEvent, ScanTopology};
use crate::screening::{seed_defaults, ScreeningPipeline};
use crate::session::SessionCoordinator;
use crate::store::Store;
use crate::tags::TagEngine;
use crate::types::PathLocks;
use crate::vector_index::VectorIndex;
use crate::vectorize::{DocumentExtractor, PlainTextExtractor, VectorizePipeline};
use crate::watch::{start_watcher, WatchHandle};

pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub queue: Arc<ConfigQueue>,
    pub router: Arc<CapabilityRouter>,
    pub index: Arc<VectorIndex>,
    pub screening: Arc<ScreeningPipeline>,
    pub tags: Arc<TagEngine>,
    pub vectorize: Arc<VectorizePipeline>,
    pub sessions: Arc<SessionCoordinator>,
    pub retrieval: Arc<Retrieval>,
    pub downloader: Arc<ModelDownloader>,
    pub topology: Arc<RwLock<ScanTopology>>,
    scan_tx: SyncSender<ScanEvent>,
    watch: Mutex<Option<WatchHandle>>,
}

impl Engine {
    /// Build and wire every subsystem. The initial sweep does not start
    /// here — call [`Engine::spawn_initial_sweep`] (or the blocking variant
    /// in tests) once the caller is ready.
    pub fn start(config: EngineConfig, bus: EventBus) -> EngineResult<Arc<Engine>> {
        Self::start_with_extractor(config, bus, Arc::new(PlainTextExtractor))
    }

    pub fn start_with_extractor(
        config: EngineConfig,
        bus: EventBus,
        extractor: Arc<dyn DocumentExtractor>,
    ) -> EngineResult<Arc<Engine>> {
        for dir in [
            config.db_dir(),
            config.vectors_dir(),
            config.builtin_models_dir(),
            config.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let store = Arc::new(
            Store::open(&config.db_dir(), config.store.clone())
                .map_err(EngineError::Store)?,
        );
        seed_defaults(&store)?;
        let index = Arc::new(VectorIndex::open(config.vectors_dir())?);
        let path_locks = Arc::new(PathLocks::default());

        let router = Arc::new(CapabilityRouter::new(
            Arc::clone(&store),
            bus.clone(),
            &config.provider_net,
            config.retry,
        ));
        let queue = Arc::new(ConfigQueue::new(Arc::clone(&store), bus.clone()));

        // Scanner → screening and screening → tagging channels, both bounded.
        let (scan_tx, scan_rx) =
            std::sync::mpsc::sync_channel::<ScanEvent>(config.scanner.channel_capacity);
        let (tag_tx, tag_rx) =
            std::sync::mpsc::sync_channel(config.tagging.queue_capacity);

        let screening = Arc::new(ScreeningPipeline::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&index),
            tag_tx,
        )?);
        {
            let pipeline = Arc::clone(&screening);
            std::thread::Builder::new()
                .name("screening".into())
                .spawn(move || pipeline.run(scan_rx))
                .expect("spawn screening thread");
        }

        let tags = TagEngine::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&router),
            Arc::clone(&path_locks),
            config.tagging.clone(),
            config.screening.clone(),
        );
        tags.spawn_workers(tag_rx);
        tags.spawn_cloud_refresher();

        let vectorize = VectorizePipeline::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&router),
            Arc::clone(&index),
            extractor,
            Arc::clone(&path_locks),
            config.vectorize.clone(),
            config.screening.clone(),
            config.retry,
        );
        vectorize.spawn_workers();

        let sessions = SessionCoordinator::new(Arc::clone(&store), bus.clone());
        let retrieval = Retrieval::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&router),
            config.retrieval.clone(),
        );
        let downloader = Arc::new(ModelDownloader::new(
            Arc::clone(&store),
            bus.clone(),
            config.builtin_models_dir(),
        ));

        let topology =
            Arc::new(RwLock::new(ScanTopology::from_store(&store)?));

        let engine = Arc::new(Engine {
            config,
            store,
            bus,
            queue,
            router,
            index,
            screening,
            tags,
            vectorize,
            sessions,
            retrieval,
            downloader,
            topology,
            scan_tx,
            watch: Mutex::new(None),
        });

        engine.spawn_database_updated_listener();
        engine.spawn_model_status_listener();
        Ok(engine)
    }

    // -----------------------------------------------------------------------
    // Initial sweep
    // -----------------------------------------------------------------------

    /// Run the bulk sweep, drain the config queue, refresh topology, and
    /// start the watcher. Completion is reported exactly once.
    pub fn run_initial_sweep(&self) -> EngineResult<usize> {
        let files = initial_sweep(&self.store, &self.scan_tx)?;
        self.queue.mark_scan_complete()?;
        self.refresh_topology()?;

        let mut watch = self.watch.lock().unwrap_or_else(|p| p.into_inner());
        if watch.is_none() {
            *watch = Some(start_watcher(
                Arc::clone(&self.topology),
                self.scan_tx.clone(),
                self.config.scanner.clone(),
            ));
        }

        self.bus.emit(
            names::SYSTEM_STATUS,
            json!({ "initial_scan": "complete", "files": files }),
        );
        Ok(files)
    }

    pub fn spawn_initial_sweep(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("initial-sweep".into())
            .spawn(move || {
                if let Err(e) = engine.run_initial_sweep() {
                    warn!(error = %e, "Initial sweep failed");
                    engine.bus.emit(
                        names::API_ERROR,
                        json!({ "code": "initial_sweep_failed", "message": e.to_string() }),
                    );
                }
            })
            .expect("spawn initial sweep");
    }

    // -----------------------------------------------------------------------
    // Derived-state refresh
    // -----------------------------------------------------------------------

    pub fn refresh_topology(&self) -> EngineResult<()> {
        let fresh = ScanTopology::from_store(&self.store)?;
        if let Some(watch) = self.watch.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
            watch.refresh_roots(&fresh);
        }
        *self.topology.write().unwrap_or_else(|p| p.into_inner()) = fresh;
        self.screening.refresh_cache()?;
        Ok(())
    }

    /// Rebuild caches and prune stale subtrees whenever the config queue
    /// applies a topology change.
    fn spawn_database_updated_listener(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let sub = self.bus.subscribe(Some(names::DATABASE_UPDATED));
        std::thread::Builder::new()
            .name("db-updated".into())
            .spawn(move || {
                for event in sub.rx.iter() {
                    if let Err(e) = engine.refresh_topology() {
                        warn!(error = %e, "Topology refresh failed");
                    }

                    // A root that just became whitelisted gets walked now;
                    // the initial sweep never saw it.
                    let kind = event.payload["kind"].as_str().unwrap_or_default();
                    if matches!(kind, "add_white" | "toggle_status") {
                        if let Some(path) = event.payload["path"].as_str() {
                            let topo =
                                engine.topology.read().unwrap_or_else(|p| p.into_inner()).clone();
                            if topo.whitelists.iter().any(|w| w.path == path) {
                                let _ = crate::scan::walk_root(path, &topo, &engine.scan_tx);
                            }
                        }
                    }

                    let stale: Vec<String> = event.payload["stale_paths"]
                        .as_array()
                        .map(|a| {
                            a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
                        })
                        .unwrap_or_default();
                    if stale.is_empty() {
                        continue;
                    }
                    if let Err(e) = engine.screening.prune_stale_paths(&stale) {
                        warn!(error = %e, "Stale prune failed");
                    }
                    for path in &stale {
                        if let Err(e) = engine.sessions.co_read_target_gone(path) {
                            warn!(path = path.as_str(), error = %e, "Co-read exit failed");
                        }
                    }
                }
            })
            .expect("spawn database-updated listener");
    }

    /// A restored capability binding lifts the LLM tagging suspension.
    fn spawn_model_status_listener(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let sub = self.bus.subscribe(Some(names::MODEL_STATUS_CHANGED));
        std::thread::Builder::new()
            .name("model-status".into())
            .spawn(move || {
                for _event in sub.rx.iter() {
                    engine.tags.resume_llm();
                }
            })
            .expect("spawn model-status listener");
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Graceful stop: drain nothing new, flush the vector index.
    pub fn shutdown(&self) {
        self.vectorize.shutdown();
        if let Err(e) = self.index.commit() {
            warn!(error = %e, "Vector index flush failed during shutdown");
        }
        info!("Engine shut down");
    }
}
