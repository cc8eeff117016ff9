//! Session and co-reading coordinator.
//!
//! Per session: a pinned-file set, a tool selection, and an optional
//! scenario. The co-reading state machine is `Normal ↔ CoReading(pdf_path)`
//! with atomic transitions — scenario id and metadata are written in one
//! store transaction or not at all. Entering co-reading has hard
//! preconditions and rejects with a precise reason code otherwise.
//!
//! The tool channel relays `tool-call-request` events to the host and
//! accepts correlated responses back through the HTTP surface.

use mindex_core::error::{codes, EngineError, EngineResult};
use mindex_core::types::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::events::{names, EventBus};
use crate::store::Store;

pub const SCENARIO_CO_READING: &str = "co_reading";

pub struct SessionCoordinator {
    store: Arc<Store>,
    bus: EventBus,
    /// In-flight tool calls: call id → session id.
    pending_tool_calls: Mutex<HashMap<String, String>>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self { store, bus, pending_tool_calls: Mutex::new(HashMap::new()) })
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub fn create(&self, name: &str) -> EngineResult<Session> {
        Ok(self.store.create_session(name)?)
    }

    pub fn get(&self, id: &str) -> EngineResult<Session> {
        Ok(self.store.get_session(id)?)
    }

    pub fn list(&self) -> EngineResult<Vec<Session>> {
        Ok(self.store.list_sessions()?)
    }

    pub fn rename(&self, id: &str, name: &str) -> EngineResult<Session> {
        Ok(self.store.rename_session(id, name)?)
    }

    /// Deleting a session is also an exit from any scenario it was in.
    pub fn delete(&self, id: &str) -> EngineResult<()> {
        self.store.delete_session(id)?;
        Ok(())
    }

    pub fn pin(&self, id: &str, file_path: &str, metadata: Value) -> EngineResult<()> {
        Ok(self.store.pin_file(id, file_path, &metadata)?)
    }

    pub fn unpin(&self, id: &str, file_path: &str) -> EngineResult<()> {
        Ok(self.store.unpin_file(id, file_path)?)
    }

    pub fn pinned(&self, id: &str) -> EngineResult<Vec<PinnedFile>> {
        Ok(self.store.pinned_files(id)?)
    }

    pub fn set_tools(&self, id: &str, tools: &[String]) -> EngineResult<()> {
        Ok(self.store.set_session_tools(id, tools)?)
    }

    pub fn tools(&self, id: &str) -> EngineResult<Vec<String>> {
        Ok(self.store.session_tools(id)?)
    }

    // -----------------------------------------------------------------------
    // Co-reading state machine
    // -----------------------------------------------------------------------

    /// `Normal → CoReading(pdf_path)`. Preconditions, in check order:
    /// session exists, not already co-reading, the file is pinned, its
    /// vectorization task completed, and its modality is text or mixed.
    pub fn enter_co_reading(&self, session_id: &str, pdf_path: &str) -> EngineResult<Session> {
        let session = self.store.get_session(session_id)?;
        if session.scenario_id.is_some() {
            return Err(EngineError::Rejected {
                reason: codes::ALREADY_CO_READING,
                detail: format!("session {session_id} already has a scenario"),
            });
        }

        let pinned = self.store.pinned_files(session_id)?;
        if !pinned.iter().any(|p| p.file_path == pdf_path) {
            return Err(EngineError::Rejected {
                reason: codes::NOT_PINNED,
                detail: format!("{pdf_path} is not pinned in session {session_id}"),
            });
        }

        let ready = self
            .store
            .task_for_file(pdf_path)?
            .is_some_and(|t| t.status == TaskStatus::Completed);
        if !ready {
            return Err(EngineError::Rejected {
                reason: codes::NOT_READY,
                detail: format!("{pdf_path} is not vectorized yet"),
            });
        }

        match self.store.file_modality(pdf_path)? {
            Some(FileModality::Text) | Some(FileModality::Mixed) => {}
            _ => {
                return Err(EngineError::Rejected {
                    reason: codes::WRONG_MODALITY,
                    detail: format!("{pdf_path} has no text content to co-read"),
                })
            }
        }

        let session = self.store.set_session_scenario(
            session_id,
            Some(SCENARIO_CO_READING),
            &json!({ "pdf_path": pdf_path }),
        )?;
        info!(session = session_id, file = pdf_path, "Entered co-reading");
        Ok(session)
    }

    /// `CoReading → Normal`. Explicit exit.
    pub fn exit_co_reading(&self, session_id: &str) -> EngineResult<Session> {
        let session = self.store.get_session(session_id)?;
        if session.scenario_id.as_deref() != Some(SCENARIO_CO_READING) {
            return Err(EngineError::Rejected {
                reason: codes::NOT_CO_READING,
                detail: format!("session {session_id} is not co-reading"),
            });
        }
        let session =
            self.store.set_session_scenario(session_id, None, &json!({}))?;
        info!(session = session_id, "Exited co-reading");
        Ok(session)
    }

    /// External signal: the co-read target is gone. Every session reading it
    /// drops back to normal.
    pub fn co_read_target_gone(&self, file_path: &str) -> EngineResult<usize> {
        let mut exited = 0usize;
        for session in self.store.list_sessions()? {
            if session.scenario_id.as_deref() == Some(SCENARIO_CO_READING)
                && session.metadata["pdf_path"].as_str() == Some(file_path)
            {
                self.store.set_session_scenario(&session.id, None, &json!({}))?;
                exited += 1;
            }
        }
        if exited > 0 {
            debug!(file = file_path, sessions = exited, "Co-read target gone");
        }
        Ok(exited)
    }

    /// Pinned file paths, for session-scoped retrieval.
    pub fn pinned_paths(&self, session_id: &str) -> EngineResult<Vec<String>> {
        Ok(self.pinned(session_id)?.into_iter().map(|p| p.file_path).collect())
    }

    // -----------------------------------------------------------------------
    // Tool channel
    // -----------------------------------------------------------------------

    /// Emit a `tool-call-request` toward the host; returns the call id used
    /// to correlate the response.
    pub fn request_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> EngineResult<String> {
        self.store.get_session(session_id)?;
        let selected = self.store.session_tools(session_id)?;
        if !selected.iter().any(|t| t == tool_name) {
            return Err(EngineError::Rejected {
                reason: "tool_not_selected",
                detail: format!("{tool_name} is not selected in session {session_id}"),
            });
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        self.pending_tool_calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(call_id.clone(), session_id.to_string());
        self.bus.emit(
            names::TOOL_CALL_REQUEST,
            json!({
                "call_id": call_id,
                "session_id": session_id,
                "tool": tool_name,
                "arguments": arguments,
            }),
        );
        Ok(call_id)
    }

    /// Host response relay: forwards result or error under the matching
    /// event name, consuming the pending call.
    pub fn respond_tool_call(
        &self,
        call_id: &str,
        result: Result<Value, String>,
    ) -> EngineResult<()> {
        let session_id = self
            .pending_tool_calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(call_id)
            .ok_or(EngineError::Rejected {
                reason: "unknown_call",
                detail: format!("no pending tool call {call_id}"),
            })?;

        match result {
            Ok(value) => self.bus.emit(
                names::TOOL_CALL_RESPONSE,
                json!({ "call_id": call_id, "session_id": session_id, "result": value }),
            ),
            Err(message) => self.bus.emit(
                names::TOOL_CALL_ERROR,
                json!({ "call_id": call_id, "session_id": session_id, "error": message }),
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use chrono::{TimeZone, Utc};
    use mindex_core::config::EventBusConfig;

    fn coordinator() -> (Arc<SessionCoordinator>, Arc<Store>, MemorySink, EventBus) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(EventBusConfig::default(), Box::new(sink.clone()));
        (SessionCoordinator::new(Arc::clone(&store), bus.clone()), store, sink, bus)
    }

    fn vectorized_file(store: &Store, path: &str) {
        let candidate = FileCandidate {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            extension: Some("pdf".into()),
            size: 100,
            mtime: Utc.timestamp_opt(1_000, 0).unwrap(),
            is_bundle: false,
        };
        store.upsert_screening(&candidate, None).unwrap();
        let task = store.create_task(path).unwrap();
        store
            .update_task(
                task.id,
                TaskStatus::Completed,
                TaskStage::Completed,
                100,
                Some(1),
                Some(2),
                None,
            )
            .unwrap();
        store
            .replace_chunk_set(
                path,
                &[
                    crate::store::NewChunk {
                        tier: ChunkTier::Parent,
                        parent_ordinal: None,
                        ordinal: 0,
                        text: Some("parent".into()),
                        modality: Modality::Text,
                        token_count: 2,
                    },
                    crate::store::NewChunk {
                        tier: ChunkTier::Child,
                        parent_ordinal: Some(0),
                        ordinal: 0,
                        text: Some("child".into()),
                        modality: Modality::Text,
                        token_count: 2,
                    },
                ],
            )
            .unwrap();
    }

    #[test]
    fn co_reading_requires_completed_vectorization() {
        let (coordinator, store, _sink, _bus) = coordinator();
        let session = coordinator.create("reading").unwrap();
        coordinator.pin(&session.id, "/paper.pdf", json!({})).unwrap();

        // Processing task → not_ready, session unchanged.
        let candidate = FileCandidate {
            path: "/paper.pdf".into(),
            name: "paper.pdf".into(),
            extension: Some("pdf".into()),
            size: 10,
            mtime: Utc.timestamp_opt(1, 0).unwrap(),
            is_bundle: false,
        };
        store.upsert_screening(&candidate, None).unwrap();
        let task = store.create_task("/paper.pdf").unwrap();
        store
            .update_task(task.id, TaskStatus::Processing, TaskStage::Vectorizing, 50, None, None, None)
            .unwrap();

        let err = coordinator.enter_co_reading(&session.id, "/paper.pdf").unwrap_err();
        match err {
            EngineError::Rejected { reason, .. } => assert_eq!(reason, codes::NOT_READY),
            other => panic!("unexpected: {other:?}"),
        }
        let after = coordinator.get(&session.id).unwrap();
        assert!(after.scenario_id.is_none(), "rejected transition must not mutate");
    }

    #[test]
    fn co_reading_enter_and_exit_are_atomic() {
        let (coordinator, store, _sink, _bus) = coordinator();
        let session = coordinator.create("reading").unwrap();
        coordinator.pin(&session.id, "/paper.pdf", json!({})).unwrap();
        vectorized_file(&store, "/paper.pdf");

        let entered = coordinator.enter_co_reading(&session.id, "/paper.pdf").unwrap();
        assert_eq!(entered.scenario_id.as_deref(), Some(SCENARIO_CO_READING));
        assert_eq!(entered.metadata["pdf_path"], "/paper.pdf");

        let again = coordinator.enter_co_reading(&session.id, "/paper.pdf").unwrap_err();
        match again {
            EngineError::Rejected { reason, .. } => {
                assert_eq!(reason, codes::ALREADY_CO_READING)
            }
            other => panic!("unexpected: {other:?}"),
        }

        let exited = coordinator.exit_co_reading(&session.id).unwrap();
        assert!(exited.scenario_id.is_none());
        assert!(exited.metadata.get("pdf_path").is_none());
    }

    #[test]
    fn unpinned_file_is_rejected() {
        let (coordinator, store, _sink, _bus) = coordinator();
        let session = coordinator.create("s").unwrap();
        vectorized_file(&store, "/other.pdf");
        let err = coordinator.enter_co_reading(&session.id, "/other.pdf").unwrap_err();
        match err {
            EngineError::Rejected { reason, .. } => assert_eq!(reason, codes::NOT_PINNED),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn target_gone_exits_every_reader() {
        let (coordinator, store, _sink, _bus) = coordinator();
        let a = coordinator.create("a").unwrap();
        let b = coordinator.create("b").unwrap();
        for session in [&a, &b] {
            coordinator.pin(&session.id, "/paper.pdf", json!({})).unwrap();
        }
        vectorized_file(&store, "/paper.pdf");
        coordinator.enter_co_reading(&a.id, "/paper.pdf").unwrap();

        let exited = coordinator.co_read_target_gone("/paper.pdf").unwrap();
        assert_eq!(exited, 1);
        assert!(coordinator.get(&a.id).unwrap().scenario_id.is_none());
        assert!(coordinator.get(&b.id).unwrap().scenario_id.is_none());
    }

    #[test]
    fn tool_channel_round_trip() {
        let (coordinator, _store, sink, bus) = coordinator();
        let session = coordinator.create("tools").unwrap();
        coordinator.set_tools(&session.id, &["pdf_viewer".to_string()]).unwrap();

        let call_id = coordinator
            .request_tool_call(&session.id, "pdf_viewer", json!({ "page": 3 }))
            .unwrap();
        coordinator.respond_tool_call(&call_id, Ok(json!({ "ok": true }))).unwrap();
        bus.sync();

        let events: Vec<String> = sink.frames().into_iter().map(|f| f.event).collect();
        assert!(events.contains(&names::TOOL_CALL_REQUEST.to_string()));
        assert!(events.contains(&names::TOOL_CALL_RESPONSE.to_string()));

        // Responding twice is an error — the call is consumed.
        assert!(coordinator.respond_tool_call(&call_id, Ok(json!({}))).is_err());
    }

    #[test]
    fn unselected_tool_is_rejected() {
        let (coordinator, _store, _sink, _bus) = coordinator();
        let session = coordinator.create("tools").unwrap();
        let err = coordinator
            .request_tool_call(&session.id, "pdf_viewer", json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected { reason: "tool_not_selected", .. }));
    }
}
