//! End-to-end scenarios over a full engine: scan → screening → tagging →
//! vectorization → retrieval, plus the config-queue and event-bridge
//! behaviors a host relies on.

mod helpers;

use helpers::{wait_until, TestHarness};
use mindex_core::types::*;
use mindex_server::events::names;
use mindex_server::vectorize::Priority;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scenario: whitelist + blacklist interaction
// ---------------------------------------------------------------------------

#[test]
fn whitelist_blacklist_interaction() {
    let h = TestHarness::new();
    h.write_file("readme.md", "# readme\n\nnotes");
    h.write_file("draft.pdf", "draft text");
    h.write_file(".cache/junk.tmp", "junk");
    h.write_file(".cache/deep/more.txt", "junk");

    h.whitelist_watched();
    let cache = h.watched.join(".cache");
    h.store()
        .add_folder(&cache.to_string_lossy(), None, true, false)
        .expect("blacklist .cache");
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        h.store().get_screening(&h.watched.join("readme.md").to_string_lossy()).unwrap().is_some()
            && h.store()
                .get_screening(&h.watched.join("draft.pdf").to_string_lossy())
                .unwrap()
                .is_some()
    }));

    // Nothing under .cache may surface (the .tmp seed rule would exclude
    // junk.tmp anyway; more.txt only survives if the blacklist failed).
    let all = h
        .store()
        .query_screening(&mindex_server::store::ScreeningQuery::default())
        .unwrap();
    assert!(all.iter().all(|r| !r.file_path.contains("/.cache/")), "blacklist leaked: {all:?}");
}

// ---------------------------------------------------------------------------
// Scenario: config queue flush
// ---------------------------------------------------------------------------

#[test]
fn config_queue_flush_yields_final_state() {
    let h = TestHarness::new();
    assert!(!h.engine.queue.is_scan_complete());

    h.engine.queue.add_whitelist("/A", None).unwrap();
    h.engine.queue.add_blacklist("/A/secret", None).unwrap();
    h.engine.queue.toggle_folder("/A").unwrap();
    h.engine.queue.delete_folder("/A").unwrap();
    assert!(h.store().list_folders().unwrap().is_empty(), "queued changes must not apply yet");

    h.engine.run_initial_sweep().unwrap();

    assert!(h.engine.queue.is_scan_complete());
    assert!(h.store().list_folders().unwrap().is_empty());
    let rows = h
        .store()
        .query_screening(&mindex_server::store::ScreeningQuery {
            path_substring: Some("/A/".into()),
            ..Default::default()
        })
        .unwrap();
    assert!(rows.is_empty(), "no orphan screening rows for /A/*");
}

// ---------------------------------------------------------------------------
// Scenario: folder added after scan completion is walked inline
// ---------------------------------------------------------------------------

#[test]
fn folder_added_after_scan_gets_indexed() {
    let h = TestHarness::new();
    h.engine.run_initial_sweep().unwrap();

    let path = h.write_file("late.md", "added after the initial sweep");
    let outcome = h.engine.queue.add_whitelist(&h.watched.to_string_lossy(), None).unwrap();
    assert_eq!(outcome.status(), "executed");

    assert!(wait_until(Duration::from_secs(5), || {
        h.store().get_screening(&path).unwrap().is_some()
    }));
}

// ---------------------------------------------------------------------------
// Scenario: vectorization progress events
// ---------------------------------------------------------------------------

#[test]
fn vectorization_completes_with_hierarchical_chunks() {
    let (h, _provider) = TestHarness::with_provider();
    let path = h.write_file(
        "paper.md",
        "Introduction to the topic.\n\nA second section with more words to chunk.",
    );
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        h.store().get_screening(&path).unwrap().is_some()
    }));

    h.engine.vectorize.enqueue(&path, Priority::Batch).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        h.store()
            .task_for_file(&path)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }));

    let task = h.store().task_for_file(&path).unwrap().unwrap();
    let parents = task.parent_count.unwrap();
    let children = task.child_count.unwrap();
    assert!(parents >= 1);
    assert!(children >= parents);

    // Every child chunk has a parent in the same file.
    let chunks = h.store().chunks_for_file(&path).unwrap();
    let parent_ids: Vec<i64> =
        chunks.iter().filter(|c| c.tier == ChunkTier::Parent).map(|c| c.id).collect();
    for child in chunks.iter().filter(|c| c.tier == ChunkTier::Child) {
        assert!(parent_ids.contains(&child.parent_id.unwrap()));
        assert_eq!(child.file_path, path);
    }

    // Exactly one started and one completed frame for this file.
    let started = h.frames_named(names::MULTIVECTOR_STARTED);
    let completed = h.frames_named(names::MULTIVECTOR_COMPLETED);
    assert_eq!(started.iter().filter(|f| f.payload["file_path"] == path.as_str()).count(), 1);
    let done: Vec<_> =
        completed.iter().filter(|f| f.payload["file_path"] == path.as_str()).collect();
    assert_eq!(done.len(), 1);
    assert!(done[0].payload["parent_count"].as_i64().unwrap() >= 1);

    let screening = h.store().get_screening(&path).unwrap().unwrap();
    assert_eq!(screening.status, ScreeningStatus::Vectorized);
}

// ---------------------------------------------------------------------------
// Scenario: capability gap
// ---------------------------------------------------------------------------

#[test]
fn capability_gap_suspends_llm_tagging_once() {
    let h = TestHarness::new(); // no provider, no assignments
    let a = h.write_file("a.md", "first document body");
    let b = h.write_file("b.md", "second document body");
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();

    // Both files reach tagged state on system tags alone.
    assert!(wait_until(Duration::from_secs(5), || {
        [&a, &b].iter().all(|p| {
            h.store()
                .get_screening(p)
                .unwrap()
                .is_some_and(|r| r.status == ScreeningStatus::Tagged)
        })
    }));

    let missing = h.frames_named(names::TAGGING_MODEL_MISSING);
    assert_eq!(missing.len(), 1, "tagging-model-missing fires exactly once");

    for path in [&a, &b] {
        let row = h.store().get_screening(path).unwrap().unwrap();
        let tags = h.store().tags_for_file(row.id).unwrap();
        assert!(
            tags.iter().any(|t| t.kind == TagKind::System),
            "system tags must continue for {path}"
        );
        assert!(tags.iter().all(|t| t.kind != TagKind::Llm));
    }
}

// ---------------------------------------------------------------------------
// Scenario: hybrid retrieval over vectorized content
// ---------------------------------------------------------------------------

#[test]
fn retrieval_finds_exact_content_with_parent_context() {
    let (h, _provider) = TestHarness::with_provider();
    let needle = h.write_file("notes.md", "quarterly budget figures for the finance team");
    let noise = h.write_file("other.md", "vacation photos and packing checklist");
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();
    for path in [&needle, &noise] {
        assert!(wait_until(Duration::from_secs(5), || {
            h.store().get_screening(path).unwrap().is_some()
        }));
        h.engine.vectorize.enqueue(path, Priority::Batch).unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            h.store()
                .task_for_file(path)
                .unwrap()
                .is_some_and(|t| t.status == TaskStatus::Completed)
        }));
    }

    // The fake embedder maps identical text to identical vectors, so the
    // exact content is the top hit.
    let hits = h
        .engine
        .retrieval
        .retrieve(&mindex_server::retrieval::RetrievalRequest {
            query: "quarterly budget figures for the finance team".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].file_path, needle);
    assert!(hits[0].child_text.is_some());
    assert!(hits[0].parent_text.is_some());
    assert!(hits[0].score >= hits.last().unwrap().score);
}

#[test]
fn session_scoped_retrieval_only_sees_pinned_files() {
    let (h, _provider) = TestHarness::with_provider();
    let pinned = h.write_file("pinned.md", "alpha content in the pinned file");
    let other = h.write_file("other.md", "alpha content in another file");
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();
    for path in [&pinned, &other] {
        assert!(wait_until(Duration::from_secs(5), || {
            h.store().get_screening(path).unwrap().is_some()
        }));
        h.engine.vectorize.enqueue(path, Priority::Interactive).unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            h.store()
                .task_for_file(path)
                .unwrap()
                .is_some_and(|t| t.status == TaskStatus::Completed)
        }));
    }

    let session = h.engine.sessions.create("scoped").unwrap();
    h.engine.sessions.pin(&session.id, &pinned, serde_json::json!({})).unwrap();
    let scope = h.engine.sessions.pinned_paths(&session.id).unwrap();

    let hits = h
        .engine
        .retrieval
        .retrieve(&mindex_server::retrieval::RetrievalRequest {
            query: "alpha content".into(),
            file_paths: Some(scope),
            ..Default::default()
        })
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.file_path == pinned), "scope leaked: {hits:?}");
}

// ---------------------------------------------------------------------------
// Scenario: re-screening an unchanged file stays silent
// ---------------------------------------------------------------------------

#[test]
fn unchanged_rescreen_emits_nothing() {
    let h = TestHarness::new();
    let path = h.write_file("stable.md", "unchanging content");
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        h.store().get_screening(&path).unwrap().is_some()
    }));

    // Let the throttle window expire, then re-walk the same tree.
    std::thread::sleep(Duration::from_millis(300));
    let before = h.frames_named(names::SCREENING_RESULT_UPDATED).len();
    let topo = h.engine.topology.read().unwrap().clone();
    let (tx, rx) = std::sync::mpsc::sync_channel(256);
    mindex_server::scan::sweep_all(&topo, &tx);
    drop(tx);
    for event in rx {
        if let mindex_server::scan::ScanEvent::Candidate(c) = event {
            h.engine.screening.process(&c).unwrap();
        }
    }
    std::thread::sleep(Duration::from_millis(300));
    let after = h.frames_named(names::SCREENING_RESULT_UPDATED).len();
    assert_eq!(before, after, "identical fingerprints must not emit");
}

// ---------------------------------------------------------------------------
// Scenario: co-reading precondition over the full engine
// ---------------------------------------------------------------------------

#[test]
fn co_reading_rejects_processing_file() {
    let (h, _provider) = TestHarness::with_provider();
    let path = h.write_file("paper.md", "a paper being read");
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        h.store().get_screening(&path).unwrap().is_some()
    }));

    let session = h.engine.sessions.create("reading").unwrap();
    h.engine.sessions.pin(&session.id, &path, serde_json::json!({})).unwrap();

    // Seed a processing task directly; the coordinator must reject.
    let task = h.store().create_task(&path).unwrap();
    h.store()
        .update_task(task.id, TaskStatus::Processing, TaskStage::Vectorizing, 40, None, None, None)
        .unwrap();

    let err = h.engine.sessions.enter_co_reading(&session.id, &path).unwrap_err();
    match err {
        mindex_core::EngineError::Rejected { reason, .. } => assert_eq!(reason, "not_ready"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(h.engine.sessions.get(&session.id).unwrap().scenario_id.is_none());

    // Finish the task for real and the transition goes through.
    h.store()
        .update_task(task.id, TaskStatus::Completed, TaskStage::Completed, 100, Some(1), Some(1), None)
        .unwrap();
    h.engine.vectorize.enqueue(&path, Priority::Interactive).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        h.store()
            .task_for_file(&path)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }));
    let entered = h.engine.sessions.enter_co_reading(&session.id, &path).unwrap();
    assert_eq!(entered.scenario_id.as_deref(), Some("co_reading"));
    assert_eq!(entered.metadata["pdf_path"], path.as_str());
}

// ---------------------------------------------------------------------------
// Scenario: duplicate content reuses embeddings
// ---------------------------------------------------------------------------

#[test]
fn duplicate_files_share_embeddings() {
    let (h, provider) = TestHarness::with_provider();
    // Above the small-file threshold so hashes are computed.
    let body = "shared duplicate body\n\n".repeat(400);
    let first = h.write_file("one.md", &body);
    let second = h.write_file("two.md", &body);
    h.whitelist_watched();
    h.engine.refresh_topology().unwrap();
    h.engine.run_initial_sweep().unwrap();

    // Wait for tagging to settle so its provider calls are out of the count.
    for path in [&first, &second] {
        assert!(wait_until(Duration::from_secs(5), || {
            h.store()
                .get_screening(path)
                .unwrap()
                .is_some_and(|r| r.status == ScreeningStatus::Tagged)
        }));
    }

    h.engine.vectorize.enqueue(&first, Priority::Batch).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        h.store()
            .task_for_file(&first)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }));
    let requests_after_first = provider.request_count();

    h.engine.vectorize.enqueue(&second, Priority::Batch).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        h.store()
            .task_for_file(&second)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }));

    // The duplicate copied chunks instead of re-embedding.
    assert_eq!(provider.request_count(), requests_after_first);
    let copied = h.store().chunks_for_file(&second).unwrap();
    assert!(!copied.is_empty());
    assert_eq!(
        copied.len(),
        h.store().chunks_for_file(&first).unwrap().len(),
        "copied chunk set must mirror the donor"
    );
}
