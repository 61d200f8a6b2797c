//! Per-project vector collection backed by usearch (HNSW, cosine)
//!
//! The collection is keyed by chunk id. The HNSW index addresses vectors
//! by internal u64 keys, so two sidecar maps translate between chunk ids
//! and keys; metadata and raw text live beside them and everything except
//! the index itself persists as JSON via rename-over-temp. A manifest
//! records the embedding model and dimension: opening a collection built
//! with a different model wipes it and reports that a full re-index is
//! needed.

use crate::error::{EngineError, VectorStoreError};
use crate::types::{Chunk, ChunkMetadata, QueryFilters};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

const INDEX_FILE: &str = "collection.usearch";
const STATE_FILE: &str = "collection.meta.json";
const MANIFEST_FILE: &str = "manifest.json";

/// One nearest-neighbor result
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    model_id: String,
    dimension: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    metadata: HashMap<u64, ChunkMetadata>,
    contents: HashMap<u64, String>,
    key_by_chunk: HashMap<String, u64>,
    next_key: u64,
}

/// Vector store for one project
pub struct VectorStore {
    dir: PathBuf,
    model_id: String,
    dimension: AtomicUsize,
    index: RwLock<Option<Index>>,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dir", &self.dir)
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Open a collection directory
    ///
    /// Returns the store plus `needs_reindex`: true when an existing
    /// collection was built with a different model id and had to be wiped.
    pub fn open(dir: &Path, model_id: &str) -> Result<(Self, bool), EngineError> {
        fs::create_dir_all(dir)
            .map_err(|e| VectorStoreError::OpenFailed(format!("{}: {}", dir.display(), e)))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let mut needs_reindex = false;
        let mut dimension = 0;

        if manifest_path.exists() {
            let raw = fs::read_to_string(&manifest_path)
                .map_err(|e| VectorStoreError::OpenFailed(e.to_string()))?;
            let manifest: Manifest = serde_json::from_str(&raw)
                .map_err(|e| VectorStoreError::Corrupted(format!("manifest: {}", e)))?;
            if manifest.model_id != model_id {
                tracing::info!(
                    "Embedding model changed ('{}' -> '{}'), wiping collection {}",
                    manifest.model_id,
                    model_id,
                    dir.display()
                );
                wipe(dir);
                needs_reindex = true;
            } else {
                dimension = manifest.dimension;
            }
        }

        let state = if !needs_reindex && dir.join(STATE_FILE).exists() {
            let raw = fs::read_to_string(dir.join(STATE_FILE))
                .map_err(|e| VectorStoreError::OpenFailed(e.to_string()))?;
            let state: StoreState = serde_json::from_str(&raw)
                .map_err(|e| VectorStoreError::Corrupted(format!("state sidecar: {}", e)))?;
            // structural check: the sidecar maps must agree with each other
            if state.key_by_chunk.len() != state.metadata.len() {
                return Err(VectorStoreError::Corrupted(format!(
                    "sidecar mismatch: {} keys vs {} metadata rows",
                    state.key_by_chunk.len(),
                    state.metadata.len()
                ))
                .into());
            }
            state
        } else {
            StoreState::default()
        };

        let store = Self {
            dir: dir.to_path_buf(),
            model_id: model_id.to_string(),
            dimension: AtomicUsize::new(dimension),
            index: RwLock::new(None),
            state: RwLock::new(state),
        };

        if dimension > 0 {
            store.load_index(dimension)?;
        }

        Ok((store, needs_reindex))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Relaxed)
    }

    fn index_options(dimension: usize) -> IndexOptions {
        let mut options = IndexOptions::default();
        options.dimensions = dimension;
        options.metric = MetricKind::Cos;
        options.quantization = ScalarKind::F32;
        options
    }

    fn load_index(&self, dimension: usize) -> Result<(), EngineError> {
        let index = Index::new(&Self::index_options(dimension))
            .map_err(|e| VectorStoreError::OpenFailed(e.to_string()))?;
        let index_path = self.dir.join(INDEX_FILE);
        if index_path.exists() {
            index
                .load(&index_path.to_string_lossy())
                .map_err(|e| VectorStoreError::Corrupted(format!("index file: {}", e)))?;
        }
        *self.index.write().expect("index lock poisoned") = Some(index);
        Ok(())
    }

    /// Lazily size the index on the first batch of vectors
    fn ensure_index(&self, dimension: usize) -> Result<(), EngineError> {
        if self.index.read().expect("index lock poisoned").is_some() {
            let stored = self.dimension.load(Ordering::Relaxed);
            if stored != dimension {
                return Err(EngineError::Embedding(
                    crate::error::EmbeddingError::DimensionMismatch {
                        expected: stored,
                        actual: dimension,
                    },
                ));
            }
            return Ok(());
        }
        self.dimension.store(dimension, Ordering::Relaxed);
        self.load_index(dimension)
    }

    /// Insert or replace chunks with their vectors
    ///
    /// Existing rows for the same chunk ids are removed first, so re-chunked
    /// files never leave stale embeddings behind.
    pub fn upsert_many(
        &self,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<usize, EngineError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        if chunks.len() != vectors.len() {
            return Err(VectorStoreError::StoreFailed(format!(
                "{} chunks with {} vectors",
                chunks.len(),
                vectors.len()
            ))
            .into());
        }
        self.ensure_index(vectors[0].len())?;

        {
            let index_guard = self.index.read().expect("index lock poisoned");
            let index = index_guard
                .as_ref()
                .ok_or_else(|| VectorStoreError::StoreFailed("index not ready".to_string()))?;
            let mut state = self.state.write().expect("state lock poisoned");

            index
                .reserve(state.metadata.len() + chunks.len())
                .map_err(|e| VectorStoreError::StoreFailed(e.to_string()))?;

            for (chunk, vector) in chunks.iter().zip(vectors) {
                if let Some(old_key) = state.key_by_chunk.remove(&chunk.chunk_id) {
                    let _ = index.remove(old_key);
                    state.metadata.remove(&old_key);
                    state.contents.remove(&old_key);
                }
                let key = state.next_key;
                state.next_key += 1;

                index
                    .add(key, vector)
                    .map_err(|e| VectorStoreError::StoreFailed(e.to_string()))?;
                state.metadata.insert(key, chunk.metadata.clone());
                state.contents.insert(key, chunk.text.clone());
                state.key_by_chunk.insert(chunk.chunk_id.clone(), key);
            }
        }

        self.persist()?;
        Ok(chunks.len())
    }

    /// Remove specific chunk ids
    pub fn delete_many(&self, chunk_ids: &[String]) -> Result<usize, EngineError> {
        let removed = {
            let index_guard = self.index.read().expect("index lock poisoned");
            let mut state = self.state.write().expect("state lock poisoned");
            let mut removed = 0;
            for chunk_id in chunk_ids {
                if let Some(key) = state.key_by_chunk.remove(chunk_id) {
                    if let Some(index) = index_guard.as_ref() {
                        let _ = index.remove(key);
                    }
                    state.metadata.remove(&key);
                    state.contents.remove(&key);
                    removed += 1;
                }
            }
            removed
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remove every chunk for one file
    pub fn delete_by_path(&self, relative_path: &str) -> Result<usize, EngineError> {
        let ids = self.list_by_path(relative_path);
        self.delete_many(&ids)
    }

    /// Chunk ids currently stored for one file
    pub fn list_by_path(&self, relative_path: &str) -> Vec<String> {
        let state = self.state.read().expect("state lock poisoned");
        let mut ids: Vec<String> = state
            .key_by_chunk
            .iter()
            .filter(|(_, key)| {
                state
                    .metadata
                    .get(key)
                    .is_some_and(|m| m.relative_path == relative_path)
            })
            .map(|(chunk_id, _)| chunk_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// k-nearest-neighbor search with optional metadata filters
    pub fn knn(
        &self,
        query: &[f32],
        k: usize,
        filter: &QueryFilters,
    ) -> Result<Vec<VectorHit>, EngineError> {
        let index_guard = self.index.read().expect("index lock poisoned");
        let Some(index) = index_guard.as_ref() else {
            return Ok(Vec::new());
        };

        // over-fetch when filtering so post-filter results can still fill k
        let fetch = if filter.is_empty() { k } else { k * 3 };
        let matches = index
            .search(query, fetch)
            .map_err(|e| VectorStoreError::SearchFailed(e.to_string()))?;

        let state = self.state.read().expect("state lock poisoned");
        let mut hits = Vec::new();
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(metadata) = state.metadata.get(key) else {
                continue;
            };
            if !filter.matches(metadata) {
                continue;
            }
            let chunk_id = state
                .key_by_chunk
                .iter()
                .find(|(_, k)| *k == key)
                .map(|(id, _)| id.clone());
            let Some(chunk_id) = chunk_id else { continue };

            hits.push(VectorHit {
                chunk_id,
                score: distance_to_similarity(*distance),
                metadata: metadata.clone(),
                text: state.contents.get(key).cloned().unwrap_or_default(),
            });
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().expect("state lock poisoned").metadata.len()
    }

    /// Distinct indexed files
    pub fn file_count(&self) -> usize {
        let state = self.state.read().expect("state lock poisoned");
        let files: std::collections::HashSet<&str> = state
            .metadata
            .values()
            .map(|m| m.relative_path.as_str())
            .collect();
        files.len()
    }

    fn persist(&self) -> Result<(), EngineError> {
        let persist = || -> Result<()> {
            let index_guard = self.index.read().expect("index lock poisoned");
            if let Some(index) = index_guard.as_ref() {
                index
                    .save(&self.dir.join(INDEX_FILE).to_string_lossy())
                    .map_err(|e| anyhow::anyhow!("saving index: {}", e))?;
            }
            drop(index_guard);

            let state = self.state.read().expect("state lock poisoned");
            let body = serde_json::to_string(&*state).context("serializing state sidecar")?;
            drop(state);
            let tmp = self.dir.join(format!("{}.tmp", STATE_FILE));
            fs::write(&tmp, body).context("writing state sidecar")?;
            fs::rename(&tmp, self.dir.join(STATE_FILE)).context("renaming state sidecar")?;

            let manifest = Manifest {
                model_id: self.model_id.clone(),
                dimension: self.dimension.load(Ordering::Relaxed),
            };
            let body = serde_json::to_string_pretty(&manifest).context("serializing manifest")?;
            let tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
            fs::write(&tmp, body).context("writing manifest")?;
            fs::rename(&tmp, self.dir.join(MANIFEST_FILE)).context("renaming manifest")?;
            Ok(())
        };
        persist().map_err(|e| VectorStoreError::StoreFailed(format!("{:#}", e)).into())
    }
}

/// Cosine distance lands in [0, 2]; map it onto a [0, 1] similarity
fn distance_to_similarity(distance: f32) -> f32 {
    (1.0 - (distance / 2.0)).clamp(0.0, 1.0)
}

fn wipe(dir: &Path) {
    for file in [INDEX_FILE, STATE_FILE, MANIFEST_FILE] {
        let _ = fs::remove_file(dir.join(file));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkKind;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn chunk(path: &str, name: &str, start: usize, text: &str) -> Chunk {
        let chunk_id = Chunk::compute_id(path, ChunkKind::Function, Some(name), start, start + 3);
        Chunk {
            chunk_id,
            text: text.to_string(),
            parent_chunk_id: None,
            metadata: ChunkMetadata {
                relative_path: path.to_string(),
                language: Some("python".to_string()),
                kind: ChunkKind::Function,
                name: Some(name.to_string()),
                start_line: start,
                end_line: start + 3,
                content_hash: "h".to_string(),
                indexed_at: 0,
                extra: BTreeMap::new(),
            },
        }
    }

    fn basis_vector(direction: usize, dimension: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[direction % dimension] = 1.0;
        v
    }

    #[test]
    fn test_open_empty() {
        let tmp = tempdir().unwrap();
        let (store, needs_reindex) = VectorStore::open(tmp.path(), "model-a").unwrap();
        assert!(!needs_reindex);
        assert_eq!(store.chunk_count(), 0);
        assert!(store.knn(&[1.0, 0.0], 5, &QueryFilters::default()).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_and_knn() {
        let tmp = tempdir().unwrap();
        let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();

        let chunks = vec![
            chunk("a.py", "f", 1, "def f(): return 1"),
            chunk("a.py", "g", 5, "def g(): return 2"),
            chunk("b.py", "h", 1, "def h(): return 3"),
        ];
        let vectors = vec![
            basis_vector(0, 8),
            basis_vector(1, 8),
            basis_vector(2, 8),
        ];
        assert_eq!(store.upsert_many(&chunks, &vectors).unwrap(), 3);

        let hits = store
            .knn(&basis_vector(0, 8), 2, &QueryFilters::default())
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id, chunks[0].chunk_id);
        assert!(hits[0].score > hits.last().unwrap().score || hits.len() == 1);
    }

    #[test]
    fn test_upsert_replaces_same_chunk_id() {
        let tmp = tempdir().unwrap();
        let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();

        let original = chunk("a.py", "f", 1, "def f(): return 1");
        store
            .upsert_many(std::slice::from_ref(&original), &[basis_vector(0, 8)])
            .unwrap();

        // same id, refreshed text and embedding
        let mut updated = original.clone();
        updated.text = "def f(): return 42".to_string();
        store
            .upsert_many(std::slice::from_ref(&updated), &[basis_vector(3, 8)])
            .unwrap();

        assert_eq!(store.chunk_count(), 1);
        let hits = store
            .knn(&basis_vector(3, 8), 1, &QueryFilters::default())
            .unwrap();
        assert_eq!(hits[0].text, "def f(): return 42");
    }

    #[test]
    fn test_delete_by_path() {
        let tmp = tempdir().unwrap();
        let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();

        let chunks = vec![
            chunk("a.py", "f", 1, "one"),
            chunk("a.py", "g", 5, "two"),
            chunk("b.py", "h", 1, "three"),
        ];
        let vectors = vec![
            basis_vector(0, 4),
            basis_vector(1, 4),
            basis_vector(2, 4),
        ];
        store.upsert_many(&chunks, &vectors).unwrap();

        assert_eq!(store.delete_by_path("a.py").unwrap(), 2);
        assert_eq!(store.chunk_count(), 1);
        assert!(store.list_by_path("a.py").is_empty());
        assert_eq!(store.list_by_path("b.py").len(), 1);
    }

    #[test]
    fn test_knn_with_filters() {
        let tmp = tempdir().unwrap();
        let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();

        let mut rust_chunk = chunk("lib.rs", "alpha", 1, "fn alpha() {}");
        rust_chunk.metadata.language = Some("rust".to_string());
        let python_chunk = chunk("a.py", "beta", 1, "def beta(): pass");

        store
            .upsert_many(
                &[rust_chunk, python_chunk],
                &[basis_vector(0, 4), basis_vector(0, 4)],
            )
            .unwrap();

        let filter = QueryFilters {
            languages: vec!["rust".to_string()],
            ..QueryFilters::default()
        };
        let hits = store.knn(&basis_vector(0, 4), 5, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.relative_path, "lib.rs");
    }

    #[test]
    fn test_persistence_round_trip() {
        let tmp = tempdir().unwrap();
        let chunks = vec![chunk("a.py", "f", 1, "text")];
        {
            let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();
            store.upsert_many(&chunks, &[basis_vector(1, 4)]).unwrap();
        }
        let (reopened, needs_reindex) = VectorStore::open(tmp.path(), "model-a").unwrap();
        assert!(!needs_reindex);
        assert_eq!(reopened.chunk_count(), 1);
        assert_eq!(reopened.dimension(), 4);

        let hits = reopened
            .knn(&basis_vector(1, 4), 1, &QueryFilters::default())
            .unwrap();
        assert_eq!(hits[0].chunk_id, chunks[0].chunk_id);
        assert_eq!(hits[0].text, "text");
    }

    #[test]
    fn test_model_change_triggers_reindex() {
        let tmp = tempdir().unwrap();
        {
            let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();
            store
                .upsert_many(&[chunk("a.py", "f", 1, "x")], &[basis_vector(0, 4)])
                .unwrap();
        }
        let (reopened, needs_reindex) = VectorStore::open(tmp.path(), "model-b").unwrap();
        assert!(needs_reindex);
        assert_eq!(reopened.chunk_count(), 0);
        assert_eq!(reopened.model_id(), "model-b");
    }

    #[test]
    fn test_corrupted_sidecar_detected() {
        let tmp = tempdir().unwrap();
        {
            let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();
            store
                .upsert_many(&[chunk("a.py", "f", 1, "x")], &[basis_vector(0, 4)])
                .unwrap();
        }
        fs::write(tmp.path().join(STATE_FILE), "garbage").unwrap();
        let err = VectorStore::open(tmp.path(), "model-a").unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let tmp = tempdir().unwrap();
        let (store, _) = VectorStore::open(tmp.path(), "model-a").unwrap();
        store
            .upsert_many(&[chunk("a.py", "f", 1, "x")], &[basis_vector(0, 4)])
            .unwrap();

        let err = store
            .upsert_many(&[chunk("a.py", "g", 9, "y")], &[basis_vector(0, 8)])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Embedding(crate::error::EmbeddingError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_distance_to_similarity() {
        assert_eq!(distance_to_similarity(0.0), 1.0);
        assert_eq!(distance_to_similarity(2.0), 0.0);
        assert!(distance_to_similarity(1.0) > distance_to_similarity(1.5));
    }
}
