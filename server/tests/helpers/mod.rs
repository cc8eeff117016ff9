//! Integration test harness: a full engine over a temp data root, an
//! in-memory event sink, and a canned local provider.

pub mod fake_provider;

use mindex_core::config::EngineConfig;
use mindex_core::types::*;
use mindex_server::engine::Engine;
use mindex_server::events::{EventBus, MemorySink};
use mindex_server::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub sink: MemorySink,
    pub bus: EventBus,
    /// Directory the engine monitors; create files here.
    pub watched: PathBuf,
    _data_dir: TempDir,
    _watched_dir: TempDir,
}

impl TestHarness {
    /// Engine with fast event windows and no provider wiring.
    pub fn new() -> Self {
        let data_dir = TempDir::new().expect("temp data root");
        let watched_dir = TempDir::new().expect("temp watched dir");

        let mut config = EngineConfig::load(data_dir.path());
        config.events.throttle_ms = 200;
        config.events.debounce_ms = 50;
        config.scanner.watch_debounce_ms = 50;
        config.retry.base_delay_ms = 1;
        config.retry.max_attempts = 2;

        let sink = MemorySink::new();
        let bus = EventBus::with_sink(config.events.clone(), Box::new(sink.clone()));
        let engine = Engine::start(config, bus.clone()).expect("engine start");

        let watched = watched_dir.path().canonicalize().expect("canonical watched dir");
        TestHarness { engine, sink, bus, watched, _data_dir: data_dir, _watched_dir: watched_dir }
    }

    /// Harness plus a fake Ollama-like provider with `text` and
    /// `structured_output` bound.
    pub fn with_provider() -> (Self, fake_provider::FakeProvider) {
        let harness = Self::new();
        let provider_server = fake_provider::FakeProvider::start();

        let store = &harness.engine.store;
        let provider = store
            .add_provider(
                ProviderKind::OllamaLike,
                "fake",
                Some(&provider_server.base_url),
                None,
                false,
                ProviderSource::Configurable,
                true,
            )
            .expect("add provider");
        let model = store
            .upsert_model(
                provider.id,
                "fake-model",
                "Fake",
                Capabilities {
                    text: true,
                    vision: true,
                    tool_use: false,
                    structured_output: true,
                },
                true,
            )
            .expect("add model");
        harness.engine.router.assign(Capability::Text, model.id).expect("assign text");
        harness.engine.router.assign(Capability::Vision, model.id).expect("assign vision");
        harness
            .engine
            .router
            .assign(Capability::StructuredOutput, model.id)
            .expect("assign structured_output");

        (harness, provider_server)
    }

    pub fn store(&self) -> &Store {
        &self.engine.store
    }

    /// Register a whitelist folder directly (persisted-before-start shape)
    /// pointing at the harness's watched directory.
    pub fn whitelist_watched(&self) {
        self.store()
            .add_folder(&self.watched.to_string_lossy(), None, false, false)
            .expect("whitelist watched dir");
    }

    pub fn write_file(&self, name: &str, content: &str) -> String {
        let path = self.watched.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdirs");
        }
        std::fs::write(&path, content).expect("write file");
        path.to_string_lossy().to_string()
    }

    /// Captured frames for one event name.
    pub fn frames_named(&self, name: &str) -> Vec<BridgeEvent> {
        self.bus.sync();
        self.sink.frames().into_iter().filter(|f| f.event == name).collect()
    }
}

/// Poll until `predicate` holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    predicate()
}
