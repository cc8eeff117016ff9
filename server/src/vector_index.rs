//! On-disk vector index for child-chunk embeddings.
//!
//! Flat `Vec<f32>` storage (`n_chunks * dim`) with parallel metadata, the
//! layout that keeps cosine scans cache-friendly. Reads are concurrent;
//! mutations take the writer lock only while splicing rows in or out.
//! Snapshots go to `vectors/index.bin` via a temp-file rename, so a crash
//! mid-commit leaves the previous snapshot intact.
//!
//! Embeddings are L2-normalized at insert; search is then a dot product.

use mindex_core::error::{EngineError, EngineResult};
use mindex_core::types::Modality;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info};

const SNAPSHOT_FILE: &str = "index.bin";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One embedding headed into the index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: i64,
    pub file_path: String,
    pub modality: Modality,
    pub embedding: Vec<f32>,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: i64,
    pub file_path: String,
    pub modality: Modality,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    chunk_id: i64,
    file_path: String,
    modality: Modality,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Slab {
    dim: usize,
    entries: Vec<Entry>,
    embeddings: Vec<f32>,
}

impl Slab {
    fn slot_of(&self, chunk_id: i64) -> Option<usize> {
        self.entries.iter().position(|e| e.chunk_id == chunk_id)
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.embeddings[slot * self.dim..(slot + 1) * self.dim]
    }

    /// Swap-remove a slot, keeping the flat layout dense.
    fn remove_slot(&mut self, slot: usize) {
        let last = self.entries.len() - 1;
        self.entries.swap_remove(slot);
        if slot != last {
            let (head, tail) = self.embeddings.split_at_mut(last * self.dim);
            head[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(&tail[..self.dim]);
        }
        self.embeddings.truncate(last * self.dim);
    }
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub struct VectorIndex {
    slab: RwLock<Slab>,
    dir: PathBuf,
}

impl VectorIndex {
    /// Open the index under `vectors/`, loading the snapshot when present.
    pub fn open(dir: PathBuf) -> EngineResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let snapshot = dir.join(SNAPSHOT_FILE);
        let slab = if snapshot.exists() {
            let raw = std::fs::read(&snapshot)?;
            match bincode::deserialize::<Slab>(&raw) {
                Ok(slab) => {
                    info!(chunks = slab.entries.len(), dim = slab.dim, "Vector index loaded");
                    slab
                }
                Err(e) => {
                    // A torn snapshot is rebuilt from scratch by re-vectorizing.
                    tracing::warn!(error = %e, "Corrupt vector snapshot; starting empty");
                    Slab::default()
                }
            }
        } else {
            Slab::default()
        };
        Ok(Self { slab: RwLock::new(slab), dir })
    }

    pub fn len(&self) -> usize {
        self.slab.read().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.slab.read().unwrap_or_else(|p| p.into_inner()).dim
    }

    /// Insert or replace a batch of embeddings. All rows must share one
    /// dimensionality; the first batch fixes it.
    pub fn upsert(&self, records: Vec<VectorRecord>) -> EngineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut slab = self.slab.write().unwrap_or_else(|p| p.into_inner());
        for mut record in records {
            if record.embedding.is_empty() {
                return Err(EngineError::Io("empty embedding".into()));
            }
            if slab.dim == 0 {
                slab.dim = record.embedding.len();
            }
            if record.embedding.len() != slab.dim {
                return Err(EngineError::Io(format!(
                    "embedding dim {} does not match index dim {}",
                    record.embedding.len(),
                    slab.dim
                )));
            }
            normalize(&mut record.embedding);
            if let Some(slot) = slab.slot_of(record.chunk_id) {
                let dim = slab.dim;
                slab.embeddings[slot * dim..(slot + 1) * dim]
                    .copy_from_slice(&record.embedding);
                slab.entries[slot].file_path = record.file_path;
                slab.entries[slot].modality = record.modality;
            } else {
                slab.entries.push(Entry {
                    chunk_id: record.chunk_id,
                    file_path: record.file_path,
                    modality: record.modality,
                });
                slab.embeddings.extend_from_slice(&record.embedding);
            }
        }
        Ok(())
    }

    /// Drop embeddings by chunk id. Missing ids are ignored.
    pub fn remove(&self, chunk_ids: &[i64]) {
        let mut slab = self.slab.write().unwrap_or_else(|p| p.into_inner());
        for id in chunk_ids {
            if let Some(slot) = slab.slot_of(*id) {
                slab.remove_slot(slot);
            }
        }
    }

    /// Copy existing embeddings onto new chunk ids (content-hash dedup —
    /// duplicate files share embeddings without re-embedding).
    pub fn duplicate(&self, id_pairs: &[(i64, i64)], file_path: &str) -> EngineResult<()> {
        let mut slab = self.slab.write().unwrap_or_else(|p| p.into_inner());
        let dim = slab.dim;
        if dim == 0 {
            return Ok(());
        }
        let mut additions: Vec<(i64, Modality, Vec<f32>)> = Vec::new();
        for (source_id, new_id) in id_pairs {
            if let Some(slot) = slab.slot_of(*source_id) {
                additions.push((*new_id, slab.entries[slot].modality, slab.row(slot).to_vec()));
            }
        }
        for (chunk_id, modality, embedding) in additions {
            if slab.slot_of(chunk_id).is_none() {
                slab.entries.push(Entry {
                    chunk_id,
                    file_path: file_path.to_string(),
                    modality,
                });
                slab.embeddings.extend_from_slice(&embedding);
            }
        }
        Ok(())
    }

    /// Cosine top-k over child embeddings, optionally filtered by modality
    /// and a candidate file set. Concurrent with other readers.
    pub fn search(
        &self,
        query: &[f32],
        modality: Option<Modality>,
        files: Option<&HashSet<String>>,
        k: usize,
    ) -> Vec<VectorHit> {
        let slab = self.slab.read().unwrap_or_else(|p| p.into_inner());
        if slab.dim == 0 || query.len() != slab.dim || k == 0 {
            return Vec::new();
        }
        let mut q = query.to_vec();
        normalize(&mut q);

        let mut hits: Vec<VectorHit> = slab
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| modality.is_none_or(|m| e.modality == m))
            .filter(|(_, e)| files.is_none_or(|f| f.contains(&e.file_path)))
            .map(|(slot, e)| {
                let row = slab.row(slot);
                let score: f32 = q.iter().zip(row).map(|(a, b)| a * b).sum();
                VectorHit {
                    chunk_id: e.chunk_id,
                    file_path: e.file_path.clone(),
                    modality: e.modality,
                    score,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits
    }

    /// Persist the snapshot. Serialization happens under the read lock; the
    /// rename is atomic, so readers never observe a torn file.
    pub fn commit(&self) -> EngineResult<()> {
        let raw = {
            let slab = self.slab.read().unwrap_or_else(|p| p.into_inner());
            bincode::serialize(&*slab).map_err(|e| EngineError::Io(e.to_string()))?
        };
        let final_path = self.dir.join(SNAPSHOT_FILE);
        let tmp_path = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        std::fs::write(&tmp_path, raw)?;
        std::fs::rename(&tmp_path, &final_path)?;
        debug!(chunks = self.len(), "Vector index committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, path: &str, modality: Modality, v: Vec<f32>) -> VectorRecord {
        VectorRecord { chunk_id: id, file_path: path.to_string(), modality, embedding: v }
    }

    fn sample_index(dir: &std::path::Path) -> VectorIndex {
        let index = VectorIndex::open(dir.to_path_buf()).unwrap();
        index
            .upsert(vec![
                record(1, "/a.md", Modality::Text, vec![1.0, 0.0, 0.0]),
                record(2, "/a.md", Modality::Text, vec![0.0, 1.0, 0.0]),
                record(3, "/b.md", Modality::Text, vec![0.9, 0.1, 0.0]),
                record(4, "/b.md", Modality::Image, vec![0.0, 0.0, 1.0]),
            ])
            .unwrap();
        index
    }

    #[test]
    fn search_ranks_by_cosine() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(dir.path());
        let hits = index.search(&[1.0, 0.0, 0.0], None, None, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, 1);
        assert_eq!(hits[1].chunk_id, 3);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn modality_and_file_filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(dir.path());

        let images = index.search(&[0.1, 0.1, 0.9], Some(Modality::Image), None, 10);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].chunk_id, 4);

        let only_b: HashSet<String> = ["/b.md".to_string()].into();
        let hits = index.search(&[1.0, 0.0, 0.0], None, Some(&only_b), 10);
        assert!(hits.iter().all(|h| h.file_path == "/b.md"));
    }

    #[test]
    fn remove_then_search_misses_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(dir.path());
        index.remove(&[1, 3]);
        assert_eq!(index.len(), 2);
        let hits = index.search(&[1.0, 0.0, 0.0], None, None, 10);
        assert!(hits.iter().all(|h| h.chunk_id != 1 && h.chunk_id != 3));
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = sample_index(dir.path());
            index.commit().unwrap();
        }
        let reloaded = VectorIndex::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.len(), 4);
        assert_eq!(reloaded.dim(), 3);
        let hits = reloaded.search(&[1.0, 0.0, 0.0], None, None, 1);
        assert_eq!(hits[0].chunk_id, 1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(dir.path());
        let err = index.upsert(vec![record(9, "/c.md", Modality::Text, vec![1.0])]).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn duplicate_copies_embeddings_for_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(dir.path());
        index.duplicate(&[(1, 10), (2, 11)], "/copy.md").unwrap();
        assert_eq!(index.len(), 6);
        let copy_files: HashSet<String> = ["/copy.md".to_string()].into();
        let hits = index.search(&[1.0, 0.0, 0.0], None, Some(&copy_files), 1);
        assert_eq!(hits[0].chunk_id, 10);
        assert!(hits[0].score > 0.99);
    }
}
