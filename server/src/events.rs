//! Process-wide event bus with two sinks: in-engine subscribers and the
//! host-facing framed emitter.
//!
//! All emission funnels through one forwarder thread (the host-IPC
//! serialization thread), which applies a per-event-name delivery strategy —
//! immediate, throttle, debounce, or buffer — and writes accepted events to
//! the sink as single-line frames: sentinel, space, JSON envelope, newline.
//! Stdout carries events exclusively; logs go to stderr.
//!
//! Order within one event name is preserved. Cross-name ordering is not.

use mindex_core::config::EventBusConfig;
use mindex_core::types::BridgeEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Fixed frame prefix the host scans for on stdout.
pub const SENTINEL: &str = "@@MINDEX@@";

/// Forwarder sweep tick for debounce/buffer deadlines.
const TICK: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// Stable event names (bit-exact, consumed by the host)
// ---------------------------------------------------------------------------

pub mod names {
    pub const API_READY: &str = "api-ready";
    pub const API_LOG: &str = "api-log";
    pub const API_ERROR: &str = "api-error";

    pub const TAGS_UPDATED: &str = "tags-updated";
    pub const DATABASE_UPDATED: &str = "database-updated";
    pub const SYSTEM_STATUS: &str = "system-status";
    pub const SCREENING_RESULT_UPDATED: &str = "screening-result-updated";

    pub const FILE_TAGGING_PROGRESS: &str = "file-tagging-progress";
    pub const MULTIVECTOR_STARTED: &str = "multivector-started";
    pub const MULTIVECTOR_PROGRESS: &str = "multivector-progress";
    pub const MULTIVECTOR_COMPLETED: &str = "multivector-completed";
    pub const MULTIVECTOR_FAILED: &str = "multivector-failed";

    pub const MODEL_DOWNLOAD_PROGRESS: &str = "model-download-progress";
    pub const MODEL_DOWNLOAD_COMPLETED: &str = "model-download-completed";
    pub const MODEL_DOWNLOAD_FAILED: &str = "model-download-failed";
    pub const MODEL_STATUS_CHANGED: &str = "model-status-changed";
    pub const MODEL_VALIDATION_FAILED: &str = "model-validation-failed";
    pub const TAGGING_MODEL_MISSING: &str = "tagging-model-missing";

    pub const RAG_PROGRESS: &str = "rag-progress";
    pub const RAG_RETRIEVAL_RESULT: &str = "rag-retrieval-result";
    pub const RAG_ERROR: &str = "rag-error";

    pub const TOOL_CALL_REQUEST: &str = "tool-call-request";
    pub const TOOL_CALL_RESPONSE: &str = "tool-call-response";
    pub const TOOL_CALL_ERROR: &str = "tool-call-error";

    pub const OAUTH_CALLBACK_SUCCESS: &str = "oauth-callback-success";
    pub const OAUTH_CALLBACK_ERROR: &str = "oauth-callback-error";
}

// ---------------------------------------------------------------------------
// Delivery strategies
// ---------------------------------------------------------------------------

/// Per-event-name forwarding behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Forward every event without delay.
    Immediate,
    /// Forward the first event in a window, discard the rest.
    Throttle(Duration),
    /// Forward only after a quiet period; later events reset the timer.
    Debounce(Duration),
    /// Coalesce into a `{"batch": [...]}` payload, flushed on capacity or timer.
    Buffer { capacity: usize, flush: Duration },
}

/// Static strategy table. Progress streams throttle, the tag cloud refresh
/// debounces, everything else is immediate. Overridable per name at runtime.
fn default_strategy(name: &str, config: &EventBusConfig) -> Strategy {
    let throttle = Duration::from_millis(config.throttle_ms);
    let debounce = Duration::from_millis(config.debounce_ms);
    match name {
        names::MULTIVECTOR_PROGRESS
        | names::FILE_TAGGING_PROGRESS
        | names::MODEL_DOWNLOAD_PROGRESS
        | names::RAG_PROGRESS
        | names::SCREENING_RESULT_UPDATED => Strategy::Throttle(throttle),
        names::TAGS_UPDATED => Strategy::Debounce(debounce),
        _ => Strategy::Immediate,
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// In-memory sink capturing raw frames; used by tests to assert framing.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured frames as parsed `(event, envelope)` lines.
    pub fn frames(&self) -> Vec<BridgeEvent> {
        let raw = self.0.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(|line| {
                let json = line.strip_prefix(SENTINEL)?.trim_start();
                serde_json::from_str::<BridgeEvent>(json).ok()
            })
            .collect()
    }

    pub fn raw_lines(&self) -> Vec<String> {
        let raw = self.0.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&raw).lines().map(str::to_string).collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bus internals
// ---------------------------------------------------------------------------

enum Cmd {
    Emit(BridgeEvent),
    SetStrategy(String, Strategy),
    Subscribe { id: u64, event: Option<String>, tx: mpsc::Sender<BridgeEvent> },
    Unsubscribe(u64),
    /// Ack once every prior command has been processed.
    Sync(mpsc::Sender<()>),
}

struct NameState {
    strategy: Strategy,
    throttle_last: Option<Instant>,
    debounce_pending: Option<(BridgeEvent, Instant)>,
    buffer: Vec<BridgeEvent>,
    buffer_deadline: Option<Instant>,
}

impl NameState {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            throttle_last: None,
            debounce_pending: None,
            buffer: Vec::new(),
            buffer_deadline: None,
        }
    }
}

struct Subscriber {
    id: u64,
    /// None subscribes to every event name.
    event: Option<String>,
    tx: mpsc::Sender<BridgeEvent>,
}

struct Forwarder {
    sink: Box<dyn Write + Send>,
    config: EventBusConfig,
    states: HashMap<String, NameState>,
    subscribers: Vec<Subscriber>,
}

impl Forwarder {
    fn deliver(&mut self, event: BridgeEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => {
                if let Err(e) = writeln!(self.sink, "{SENTINEL} {json}") {
                    warn!(error = %e, "Event sink write failed");
                }
                let _ = self.sink.flush();
            }
            Err(e) => warn!(error = %e, event = event.event.as_str(), "Unserializable event"),
        }
        self.subscribers.retain(|s| {
            if s.event.as_deref().is_some_and(|name| name != event.event) {
                return true;
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    fn state_for(&mut self, name: &str) -> &mut NameState {
        let strategy = default_strategy(name, &self.config);
        self.states.entry(name.to_string()).or_insert_with(|| NameState::new(strategy))
    }

    fn handle_emit(&mut self, event: BridgeEvent) {
        let now = Instant::now();
        let to_deliver: Option<BridgeEvent> = {
            let state = self.state_for(&event.event);
            match state.strategy {
                Strategy::Immediate => Some(event),
                Strategy::Throttle(window) => {
                    let open = state.throttle_last.map_or(true, |last| now - last >= window);
                    if open {
                        state.throttle_last = Some(now);
                        Some(event)
                    } else {
                        None
                    }
                }
                Strategy::Debounce(window) => {
                    state.debounce_pending = Some((event, now + window));
                    None
                }
                Strategy::Buffer { capacity, flush } => {
                    state.buffer.push(event);
                    if state.buffer.len() >= capacity {
                        state.buffer_deadline = None;
                        Some(batch_event(std::mem::take(&mut state.buffer)))
                    } else {
                        if state.buffer_deadline.is_none() {
                            state.buffer_deadline = Some(now + flush);
                        }
                        None
                    }
                }
            }
        };
        if let Some(event) = to_deliver {
            self.deliver(event);
        }
    }

    fn sweep(&mut self, now: Instant) {
        let mut due: Vec<BridgeEvent> = Vec::new();
        for state in self.states.values_mut() {
            let debounce_due =
                state.debounce_pending.as_ref().is_some_and(|(_, deadline)| *deadline <= now);
            if debounce_due {
                if let Some((event, _)) = state.debounce_pending.take() {
                    due.push(event);
                }
            }
            let buffer_due = state.buffer_deadline.is_some_and(|d| d <= now);
            let capacity = match state.strategy {
                Strategy::Buffer { capacity, .. } => capacity,
                _ => usize::MAX,
            };
            if !state.buffer.is_empty() && (buffer_due || state.buffer.len() >= capacity) {
                due.push(batch_event(std::mem::take(&mut state.buffer)));
                state.buffer_deadline = None;
            }
        }
        for event in due {
            self.deliver(event);
        }
    }

    /// Final flush on shutdown so completions buffered or debounced at exit
    /// still reach the host.
    fn drain_pending(&mut self) {
        let mut due: Vec<BridgeEvent> = Vec::new();
        for state in self.states.values_mut() {
            if let Some((event, _)) = state.debounce_pending.take() {
                due.push(event);
            }
            if !state.buffer.is_empty() {
                due.push(batch_event(std::mem::take(&mut state.buffer)));
                state.buffer_deadline = None;
            }
        }
        for event in due {
            self.deliver(event);
        }
    }

    fn run(mut self, rx: mpsc::Receiver<Cmd>) {
        loop {
            match rx.recv_timeout(TICK) {
                Ok(Cmd::Emit(event)) => self.handle_emit(event),
                Ok(Cmd::SetStrategy(name, strategy)) => {
                    self.states.insert(name, NameState::new(strategy));
                }
                Ok(Cmd::Subscribe { id, event, tx }) => {
                    self.subscribers.push(Subscriber { id, event, tx });
                }
                Ok(Cmd::Unsubscribe(id)) => {
                    let bound: Vec<Option<String>> = self
                        .subscribers
                        .iter()
                        .filter(|s| s.id == id)
                        .map(|s| s.event.clone())
                        .collect();
                    self.subscribers.retain(|s| s.id != id);
                    // Pending throttle/debounce windows are cleared on unsubscribe.
                    for event in bound {
                        match event {
                            Some(name) => {
                                if let Some(state) = self.states.get_mut(&name) {
                                    state.throttle_last = None;
                                    state.debounce_pending = None;
                                }
                            }
                            None => {
                                for state in self.states.values_mut() {
                                    state.throttle_last = None;
                                    state.debounce_pending = None;
                                }
                            }
                        }
                    }
                }
                Ok(Cmd::Sync(ack)) => {
                    self.sweep(Instant::now());
                    let _ = ack.send(());
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.drain_pending();
                    break;
                }
            }
            self.sweep(Instant::now());
        }
    }
}

fn batch_event(events: Vec<BridgeEvent>) -> BridgeEvent {
    let name = events.first().map(|e| e.event.clone()).unwrap_or_default();
    let payloads: Vec<Value> = events.into_iter().map(|e| e.payload).collect();
    BridgeEvent::new(name, serde_json::json!({ "batch": payloads }))
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to the bus. Cloneable and cheap; all clones feed one forwarder.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Cmd>,
    next_sub: Arc<AtomicU64>,
}

/// An in-engine subscription. Call [`EventBus::unsubscribe`] when done.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<BridgeEvent>,
}

impl EventBus {
    /// Bus writing frames to an arbitrary sink (tests use [`MemorySink`]).
    pub fn with_sink(config: EventBusConfig, sink: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = mpsc::channel();
        let forwarder = Forwarder {
            sink,
            config,
            states: HashMap::new(),
            subscribers: Vec::new(),
        };
        std::thread::Builder::new()
            .name("event-forwarder".into())
            .spawn(move || forwarder.run(rx))
            .expect("spawn event forwarder");
        Self { tx, next_sub: Arc::new(AtomicU64::new(1)) }
    }

    /// Production bus: frames go to stdout.
    pub fn stdout(config: EventBusConfig) -> Self {
        Self::with_sink(config, Box::new(std::io::stdout()))
    }

    /// Emit an event under its configured strategy.
    pub fn emit(&self, name: &str, payload: Value) {
        let _ = self.tx.send(Cmd::Emit(BridgeEvent::new(name, payload)));
    }

    /// Override the strategy for one event name. Resets its pending state.
    pub fn set_strategy(&self, name: &str, strategy: Strategy) {
        let _ = self.tx.send(Cmd::SetStrategy(name.to_string(), strategy));
    }

    /// Subscribe to one event name, or every name with `None`.
    pub fn subscribe(&self, event: Option<&str>) -> Subscription {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let _ = self.tx.send(Cmd::Subscribe { id, event: event.map(str::to_string), tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(Cmd::Unsubscribe(id));
    }

    /// Block until the forwarder has processed everything sent so far and
    /// swept due deadlines. Test aid; never needed for correctness.
    pub fn sync(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Cmd::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_sink() -> (EventBus, MemorySink) {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(EventBusConfig::default(), Box::new(sink.clone()));
        (bus, sink)
    }

    #[test]
    fn frames_are_sentinel_prefixed_single_line_json() {
        let (bus, sink) = bus_with_sink();
        bus.emit(names::API_READY, serde_json::json!({ "port": 8710 }));
        bus.sync();

        let lines = sink.raw_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(SENTINEL));
        let parsed: BridgeEvent =
            serde_json::from_str(lines[0].strip_prefix(SENTINEL).unwrap().trim_start()).unwrap();
        assert_eq!(parsed.event, names::API_READY);
        assert_eq!(parsed.payload["port"], 8710);
        assert_eq!(parsed.source, "engine");
    }

    #[test]
    fn throttle_forwards_one_event_per_window() {
        let (bus, sink) = bus_with_sink();
        // 1 s window; 50 rapid updates must collapse to exactly one frame.
        for i in 0..50 {
            bus.emit(names::MULTIVECTOR_PROGRESS, serde_json::json!({ "progress": i * 2 }));
        }
        bus.sync();
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload["progress"], 0);
    }

    #[test]
    fn debounce_forwards_once_after_quiet_period() {
        let sink = MemorySink::new();
        let config = EventBusConfig { debounce_ms: 50, ..Default::default() };
        let bus = EventBus::with_sink(config, Box::new(sink.clone()));

        for _ in 0..5 {
            bus.emit(names::TAGS_UPDATED, serde_json::json!({}));
        }
        bus.sync();
        assert!(sink.frames().is_empty(), "nothing may fire during the quiet window");

        std::thread::sleep(Duration::from_millis(120));
        bus.sync();
        assert_eq!(sink.frames().len(), 1);
    }

    #[test]
    fn buffer_flushes_on_capacity() {
        let (bus, sink) = bus_with_sink();
        bus.set_strategy(
            "audit-batch",
            Strategy::Buffer { capacity: 3, flush: Duration::from_secs(60) },
        );
        for i in 0..3 {
            bus.emit("audit-batch", serde_json::json!({ "n": i }));
        }
        bus.sync();
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload["batch"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn immediate_preserves_order_within_a_name() {
        let (bus, sink) = bus_with_sink();
        for i in 0..10 {
            bus.emit(names::MULTIVECTOR_COMPLETED, serde_json::json!({ "n": i }));
        }
        bus.sync();
        let ns: Vec<i64> =
            sink.frames().iter().map(|f| f.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn subscribers_receive_matching_events() {
        let (bus, _sink) = bus_with_sink();
        let sub = bus.subscribe(Some(names::DATABASE_UPDATED));
        bus.emit(names::DATABASE_UPDATED, serde_json::json!({ "kind": "add_white" }));
        bus.emit(names::API_LOG, serde_json::json!({ "msg": "noise" }));
        bus.sync();

        let got = sub.rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.event, names::DATABASE_UPDATED);
        assert!(sub.rx.try_recv().is_err(), "non-matching event must not arrive");
        bus.unsubscribe(sub.id);
    }

    #[test]
    fn unsubscribe_clears_pending_debounce() {
        let sink = MemorySink::new();
        let config = EventBusConfig { debounce_ms: 50, ..Default::default() };
        let bus = EventBus::with_sink(config, Box::new(sink.clone()));

        let sub = bus.subscribe(Some(names::TAGS_UPDATED));
        bus.emit(names::TAGS_UPDATED, serde_json::json!({}));
        bus.unsubscribe(sub.id);
        bus.sync();

        std::thread::sleep(Duration::from_millis(120));
        bus.sync();
        assert!(sink.frames().is_empty(), "cleared window must not fire");
    }
}
