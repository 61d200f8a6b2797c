//! Indexer pipeline: bounded workers turning IndexTasks into store commits
//!
//! Workers share one bounded queue per project. Tasks for the same file
//! serialize through a per-path lock plus supersession tokens; tasks for
//! different files run in parallel up to the worker bound. An upsert
//! re-reads and re-hashes the file (a stale task is dropped; the newer
//! event supersedes it), chunks, extracts relationships, embeds, then
//! commits under the file lock in a fixed order: vector delete, vector
//! upsert, graph diff, hash cache last. The cache landing last is what
//! makes crash recovery work: a half-committed file looks unindexed and
//! the reconciliation scan redoes it.

use crate::chunker::{Chunker, FileInput, Strategy};
use crate::config::Config;
use crate::embedder::EmbeddingClient;
use crate::error::{EmbeddingError, EngineError};
use crate::graph_store::{GraphDiff, GraphStore};
use crate::hash_cache::{FileRecord, HashCache, hash_bytes};
use crate::project::Project;
use crate::relations::RelationshipExtractor;
use crate::types::{Chunk, IndexTask, TaskKind};
use crate::vector_store::VectorStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

/// Live counters for one project's pipeline
#[derive(Debug, Default)]
pub struct PipelineStatus {
    pub in_flight: AtomicUsize,
    pub transient_failures: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub last_commit_ts: AtomicI64,
}

impl PipelineStatus {
    pub fn record_commit(&self) {
        self.last_commit_ts
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }
}

/// Shared state the workers operate on
pub struct PipelineContext {
    pub project: Arc<Project>,
    pub config: Arc<Config>,
    pub cache: Arc<RwLock<HashCache>>,
    pub vector: Arc<VectorStore>,
    pub graph: Arc<GraphStore>,
    pub chunker: Arc<Chunker>,
    pub extractor: Arc<RelationshipExtractor>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub status: Arc<PipelineStatus>,
    /// newest supersession token per path
    supersede: Mutex<HashMap<String, CancellationToken>>,
    /// per-path commit locks
    file_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// permanently failed files, keyed by the content hash that failed;
    /// not retried until the content changes
    failed: Mutex<HashMap<String, String>>,
}

impl PipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: Arc<Project>,
        config: Arc<Config>,
        cache: Arc<RwLock<HashCache>>,
        vector: Arc<VectorStore>,
        graph: Arc<GraphStore>,
        chunker: Arc<Chunker>,
        extractor: Arc<RelationshipExtractor>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            project,
            config,
            cache,
            vector,
            graph,
            chunker,
            extractor,
            embedder,
            status: Arc::new(PipelineStatus::default()),
            supersede: Mutex::new(HashMap::new()),
            file_locks: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel any in-flight task for this path and register a new token
    fn supersede_path(&self, relative_path: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut map = self.supersede.lock().expect("supersede lock poisoned");
        if let Some(previous) = map.insert(relative_path.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    fn file_lock(&self, relative_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.file_locks
            .lock()
            .expect("file locks poisoned")
            .entry(relative_path.to_string())
            .or_default()
            .clone()
    }
}

/// Worker pool for one project
pub struct Pipeline {
    cancel: CancellationToken,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn `indexer.max_workers` workers draining the task queue
    pub fn spawn(
        ctx: Arc<PipelineContext>,
        receiver: Receiver<IndexTask>,
        cancel: CancellationToken,
    ) -> Self {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let worker_count = ctx.config.indexer.max_workers;
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let ctx = ctx.clone();
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(task) = task else { break };

                    ctx.status.in_flight.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = process_task(&ctx, task).await {
                        tracing::warn!("Worker {} task failed: {:#}", worker_id, e);
                    }
                    ctx.status.in_flight.fetch_sub(1, Ordering::Relaxed);
                }
                tracing::debug!("Worker {} for '{}' stopped", worker_id, ctx.project.name);
            }));
        }

        Self { cancel, workers }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Bring one file's stored representation up to date
pub async fn process_task(ctx: &PipelineContext, task: IndexTask) -> Result<(), EngineError> {
    match task.kind {
        TaskKind::Upsert => process_upsert(ctx, task).await,
        TaskKind::Delete => process_delete(ctx, task).await,
    }
}

async fn process_upsert(ctx: &PipelineContext, task: IndexTask) -> Result<(), EngineError> {
    let relative_path = task.relative_path.clone();
    let token = ctx.supersede_path(&relative_path);

    // re-read; a vanished or changed file means a newer event supersedes us
    let absolute = ctx.project.absolute_path(&relative_path);
    let bytes = match tokio::fs::read(&absolute).await {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::debug!("{} vanished before indexing, dropping task", relative_path);
            return Ok(());
        }
    };
    let content = String::from_utf8_lossy(&bytes).into_owned();
    let content_hash = hash_bytes(content.as_bytes());
    if let Some(asserted) = &task.asserted_hash
        && *asserted != content_hash
    {
        tracing::debug!("{} changed since enqueue, dropping stale task", relative_path);
        return Ok(());
    }

    // permanent failures wait for new content
    if ctx
        .failed
        .lock()
        .expect("failed map poisoned")
        .get(&relative_path)
        .is_some_and(|h| *h == content_hash)
    {
        tracing::debug!("{} failed at this hash, waiting for changes", relative_path);
        return Ok(());
    }

    let size = bytes.len() as u64;
    let mtime = tokio::fs::metadata(&absolute)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    // chunk + extract on a blocking thread; both walk the syntax tree
    let language = extension_of(&relative_path)
        .and_then(|ext| ctx.config.language_for_extension(&ext))
        .map(|l| l.to_string());
    let strategy = language
        .as_deref()
        .and_then(|l| ctx.config.strategy_for_language(l))
        .and_then(Strategy::from_name)
        .unwrap_or(Strategy::SlidingWindow);

    let chunker = ctx.chunker.clone();
    let extractor = ctx.extractor.clone();
    let rel = relative_path.clone();
    let lang = language.clone();
    let hash_for_blocking = content_hash.clone();
    let (chunks, file_graph) = tokio::task::spawn_blocking(move || {
        let file = FileInput {
            relative_path: &rel,
            language: lang.as_deref(),
            content: &content,
            content_hash: &hash_for_blocking,
        };
        let chunks = chunker.chunk_file(&file, strategy);
        let graph = extractor.extract(&rel, lang.as_deref(), &content);
        (chunks, graph)
    })
    .await
    .map_err(|e| EngineError::other(format!("chunking task panicked: {}", e)))?;

    // embed, cancellable by supersession
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = match ctx
        .embedder
        .embed(&texts, &token, &ctx.status.transient_failures)
        .await
    {
        Ok(vectors) => vectors,
        Err(EmbeddingError::Cancelled) => {
            tracing::debug!("{} superseded during embedding", relative_path);
            return Ok(());
        }
        Err(e) if e.is_transient() => {
            // retry budget exhausted; the file stays unindexed and the
            // next change or polling rescan re-enqueues it
            tracing::warn!("Embedding gave up on {}: {}", relative_path, e);
            return Ok(());
        }
        Err(e) => {
            ctx.status.permanent_failures.fetch_add(1, Ordering::Relaxed);
            ctx.failed
                .lock()
                .expect("failed map poisoned")
                .insert(relative_path.clone(), content_hash.clone());
            tracing::warn!("Permanent embedding failure for {}: {}", relative_path, e);
            return Ok(());
        }
    };

    // superseded tasks must not touch the stores, even this late
    if token.is_cancelled() {
        tracing::debug!("{} superseded before commit", relative_path);
        return Ok(());
    }

    let record = FileRecord {
        content_hash,
        size,
        mtime,
        language,
        last_indexed_at: chrono::Utc::now().timestamp(),
    };
    commit_upsert(ctx, &relative_path, chunks, vectors, file_graph, record).await?;

    ctx.failed
        .lock()
        .expect("failed map poisoned")
        .remove(&relative_path);
    ctx.status.record_commit();
    Ok(())
}

/// The per-file critical section: both stores plus the cache, cache last
async fn commit_upsert(
    ctx: &PipelineContext,
    relative_path: &str,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
    file_graph: crate::relations::FileGraph,
    record: FileRecord,
) -> Result<(), EngineError> {
    let lock = ctx.file_lock(relative_path);
    let _guard = lock.lock().await;

    let vector = ctx.vector.clone();
    let graph = ctx.graph.clone();
    let cache = ctx.cache.clone();
    let path = relative_path.to_string();

    tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
        vector.delete_by_path(&path)?;
        vector.upsert_many(&chunks, &vectors)?;

        let diff = GraphDiff {
            remove_nodes: graph.node_ids_for_file(&path),
            add_nodes: file_graph.nodes,
            add_edges: file_graph.edges,
            remove_edges: Vec::new(),
        };
        graph.apply_diff(diff)?;

        let mut cache = cache.write().expect("hash cache lock poisoned");
        cache.put(path, record);
        cache.save()
    })
    .await
    .map_err(|e| EngineError::other(format!("commit task panicked: {}", e)))?
}

async fn process_delete(ctx: &PipelineContext, task: IndexTask) -> Result<(), EngineError> {
    let relative_path = task.relative_path.clone();
    // a delete supersedes any in-flight upsert for the path
    let _token = ctx.supersede_path(&relative_path);

    let lock = ctx.file_lock(&relative_path);
    let _guard = lock.lock().await;

    let vector = ctx.vector.clone();
    let graph = ctx.graph.clone();
    let cache = ctx.cache.clone();
    let path = relative_path.clone();

    tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
        vector.delete_by_path(&path)?;
        graph.remove_by_file(&path)?;
        let mut cache = cache.write().expect("hash cache lock poisoned");
        if cache.drop_path(&path).is_some() {
            cache.save()?;
        }
        Ok(())
    })
    .await
    .map_err(|e| EngineError::other(format!("delete task panicked: {}", e)))??;

    ctx.failed
        .lock()
        .expect("failed map poisoned")
        .remove(&relative_path);
    ctx.status.record_commit();
    Ok(())
}

fn extension_of(relative_path: &str) -> Option<String> {
    std::path::Path::new(relative_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}
