//! Hybrid retrieval — semantic nearest-neighbour fused with lexical
//! matching, deduplicated by parent chunk.
//!
//! A pure ranking stage: no LLM is called here, answer synthesis belongs to
//! an external collaborator. Semantic candidates come from the vector index
//! (child chunks only), lexical scores from paths, names, and tag names.
//! Fusion is a weighted sum of normalized scores; each surviving hit
//! carries its parent context and provenance.

use mindex_core::config::RetrievalConfig;
use mindex_core::error::EngineResult;
use mindex_core::lexical::{score as lexical_score, LexicalField, LexicalQuery};
use mindex_core::types::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::capability::{CapabilityRequest, CapabilityRouter};
use crate::store::{ScreeningQuery, Store};
use crate::vector_index::VectorIndex;

/// Cap on rows pulled into the lexical pass.
const LEXICAL_CANDIDATE_LIMIT: usize = 2_000;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub modality: Option<Modality>,
    /// Restrict candidates to these files (session-scoped retrieval).
    pub file_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub chunk_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub semantic_score: f32,
    pub lexical_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub parent_text: Option<String>,
    pub child_text: Option<String>,
    pub file_path: String,
    pub modality: Option<Modality>,
    pub score: f32,
    pub provenance: Provenance,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

pub struct Retrieval {
    store: Arc<Store>,
    index: Arc<VectorIndex>,
    router: Arc<CapabilityRouter>,
    config: RetrievalConfig,
}

impl Retrieval {
    pub fn new(
        store: Arc<Store>,
        index: Arc<VectorIndex>,
        router: Arc<CapabilityRouter>,
        config: RetrievalConfig,
    ) -> Arc<Self> {
        Arc::new(Self { store, index, router, config })
    }

    pub fn retrieve(&self, request: &RetrievalRequest) -> EngineResult<Vec<RetrievalHit>> {
        let top_k = request.top_k.unwrap_or(self.config.top_k).max(1);
        let file_filter: Option<HashSet<String>> =
            request.file_paths.as_ref().map(|v| v.iter().cloned().collect());

        // 1. Semantic: embed the query, nearest-neighbour over children.
        //    Oversample so parent-dedup still fills top_k.
        let query_embedding = self
            .router
            .invoke_with_retry(&CapabilityRequest::EmbedText {
                text: request.query.clone(),
            })?
            .into_embedding()?;
        let semantic_hits = self.index.search(
            &query_embedding,
            request.modality,
            file_filter.as_ref(),
            top_k * 4,
        );

        // 2. Lexical: paths, names, and tag names.
        let lexical_scores = self.lexical_pass(&request.query, file_filter.as_ref())?;

        // 3. Fusion, then dedupe by parent keeping the best child.
        let mut best_by_parent: HashMap<i64, RetrievalHit> = HashMap::new();
        let mut chunkless: Vec<RetrievalHit> = Vec::new();

        for hit in semantic_hits {
            let semantic = normalize_cosine(hit.score);
            let lexical = lexical_scores.get(&hit.file_path).copied().unwrap_or(0.0);
            let fused =
                self.config.semantic_weight * semantic + self.config.lexical_weight * lexical;

            let chunk = self.store.get_chunk(hit.chunk_id)?;
            let parent_key = chunk.parent_id.unwrap_or(chunk.id);
            let better = best_by_parent.get(&parent_key).map_or(true, |b| fused > b.score);
            if !better {
                continue;
            }
            let parent_text = match chunk.parent_id {
                Some(pid) => self.store.get_chunk(pid)?.text,
                None => None,
            };
            best_by_parent.insert(
                parent_key,
                RetrievalHit {
                    parent_text,
                    child_text: chunk.text.clone(),
                    file_path: hit.file_path.clone(),
                    modality: Some(hit.modality),
                    score: fused,
                    provenance: Provenance {
                        chunk_id: Some(chunk.id),
                        parent_id: chunk.parent_id,
                        semantic_score: semantic,
                        lexical_score: lexical,
                    },
                },
            );
        }

        // Pure-lexical hits (files with no semantic candidate) still rank,
        // without chunk text.
        let semantic_files: HashSet<&String> =
            best_by_parent.values().map(|h| &h.file_path).collect();
        for (file_path, lexical) in &lexical_scores {
            if *lexical <= 0.0 || semantic_files.contains(file_path) {
                continue;
            }
            chunkless.push(RetrievalHit {
                parent_text: None,
                child_text: None,
                file_path: file_path.clone(),
                modality: None,
                score: self.config.lexical_weight * lexical,
                provenance: Provenance {
                    chunk_id: None,
                    parent_id: None,
                    semantic_score: 0.0,
                    lexical_score: *lexical,
                },
            });
        }

        let mut hits: Vec<RetrievalHit> = best_by_parent.into_values().collect();
        hits.extend(chunkless);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        debug!(query = request.query.as_str(), hits = hits.len(), "Retrieval done");
        Ok(hits)
    }

    /// Lexical score per candidate file.
    fn lexical_pass(
        &self,
        query: &str,
        file_filter: Option<&HashSet<String>>,
    ) -> EngineResult<HashMap<String, f32>> {
        let parsed = LexicalQuery::parse(query);
        if parsed.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = self.store.query_screening(&ScreeningQuery {
            limit: LEXICAL_CANDIDATE_LIMIT,
            ..Default::default()
        })?;

        let mut scores = HashMap::new();
        for row in rows {
            if file_filter.is_some_and(|f| !f.contains(&row.file_path)) {
                continue;
            }
            let mut fields = vec![
                LexicalField::new(&row.file_path, 0.6),
                LexicalField::new(&row.file_name, 1.0),
            ];
            for tag in self.store.tags_for_file(row.id)? {
                fields.push(LexicalField::new(&tag.name, 0.8));
            }
            let s = lexical_score(&parsed, &fields);
            if s > 0.0 {
                scores.insert(row.file_path, s);
            }
        }
        Ok(scores)
    }
}

/// Map cosine [-1, 1] onto [0, 1] for fusion.
fn normalize_cosine(score: f32) -> f32 {
    ((score + 1.0) / 2.0).clamp(0.0, 1.0)
}
