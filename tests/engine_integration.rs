//! End-to-end engine scenarios against a deterministic stub embedder
//!
//! The stub hashes whitespace tokens into a fixed-dimension bag-of-words
//! vector, so identical text always embeds identically and shared tokens
//! raise cosine similarity. That makes ranking assertions stable without
//! a live embedding service.

use async_trait::async_trait;
use coderag::embedder::EmbeddingClient;
use coderag::error::EmbeddingError;
use coderag::types::TaskKind;
use coderag::{Config, Engine, QueryOptions};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DIMENSION: usize = 32;

/// Token-bag embedder: deterministic, similarity tracks shared tokens
struct StubEmbedder {
    /// calls that fail with 503 before the service "recovers"
    fail_transient: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Self {
        Self {
            fail_transient: AtomicUsize::new(0),
        }
    }

    fn with_transient_failures(count: usize) -> Self {
        Self {
            fail_transient: AtomicUsize::new(count),
        }
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMENSION];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() % DIMENSION as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for StubEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        transient_failures: &AtomicU64,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if cancel.is_cancelled() {
            return Err(EmbeddingError::Cancelled);
        }
        if !texts.is_empty() {
            let remaining = self.fail_transient.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_transient.fetch_sub(1, Ordering::SeqCst);
                transient_failures.fetch_add(1, Ordering::Relaxed);
                return Err(EmbeddingError::ServerError {
                    status: 503,
                    body: "service warming up".to_string(),
                });
            }
        }
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    fn model_id(&self) -> &str {
        "stub-bag-of-tokens"
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.chunking.min_chunk_size = 1;
    config.indexer.debounce_ms = 50;
    config.indexer.polling_interval = 1.0;
    config
}

fn engine_with_stub(stub: StubEmbedder) -> Engine {
    Engine::with_embedder(test_config(), Arc::new(stub)).unwrap()
}

/// Wait until no tasks are pending and the cache holds `files` entries
async fn wait_for_quiescence(engine: &Engine, project: &str, files: usize) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let status = engine.indexer_status(Some(project)).await.unwrap();
        let status = status.get(project).unwrap();
        if status.queued == 0 && status.in_flight == 0 && status.files_indexed == files {
            // one extra settle round for commits racing the counters
            tokio::time::sleep(Duration::from_millis(150)).await;
            let again = engine.indexer_status(Some(project)).await.unwrap();
            let again = again.get(project).unwrap();
            if again.queued == 0 && again.in_flight == 0 && again.files_indexed == files {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "quiescence not reached: {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_single_file_index() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("a.py"),
        "def f(): return 1\n\ndef g(): return 2\n",
    )
    .unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    // two function chunks, names f and g, line ranges 1-1 and 3-3
    let response = engine
        .query("demo", "return", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 2);
    let mut names: Vec<_> = response
        .results
        .iter()
        .map(|r| (r.name.clone().unwrap(), r.start_line, r.end_line))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            ("f".to_string(), 1, 1),
            ("g".to_string(), 3, 3),
        ]
    );

    // one module node and two function nodes with contains edges
    let modules = engine
        .graph_search_nodes("demo", "a.py", Some(coderag::NodeKind::Module))
        .await
        .unwrap();
    assert_eq!(modules.len(), 1);
    let functions = engine
        .graph_search_nodes("demo", "a.py", Some(coderag::NodeKind::Function))
        .await
        .unwrap();
    assert_eq!(functions.len(), 2);

    let neighbors = engine
        .graph_neighbors("demo", &modules[0].node_id)
        .await
        .unwrap();
    let contained: Vec<_> = neighbors
        .iter()
        .filter(|n| n.relation == coderag::Relation::Contains && n.outgoing)
        .collect();
    assert_eq!(contained.len(), 2);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn modify_then_query() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("a.py"),
        "def f(): return 1\n\ndef g(): return 2\n",
    )
    .unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    let before = engine
        .query("demo", "return", &QueryOptions::default())
        .await
        .unwrap();
    let id_of_f_before = before
        .results
        .iter()
        .find(|r| r.name.as_deref() == Some("f"))
        .unwrap()
        .chunk_id
        .clone();

    std::fs::write(
        tmp.path().join("a.py"),
        "def f(): return 42\n\ndef g(): return 2\n",
    )
    .unwrap();

    // wait for the refreshed text to land
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let response = engine
            .query("demo", "return 42", &QueryOptions::default())
            .await
            .unwrap();
        if response
            .results
            .first()
            .is_some_and(|hit| hit.text.contains("return 42"))
        {
            // still two chunks; f's id unchanged, text refreshed
            assert_eq!(response.results.len(), 2);
            let f_hit = &response.results[0];
            assert_eq!(f_hit.name.as_deref(), Some("f"));
            assert_eq!(f_hit.chunk_id, id_of_f_before);
            break;
        }
        assert!(Instant::now() < deadline, "modified chunk never surfaced");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_propagation() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.py"), "def f(): return 1\n").unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    std::fs::remove_file(tmp.path().join("a.py")).unwrap();
    wait_for_quiescence(&engine, "demo", 0).await;

    let response = engine
        .query("demo", "return", &QueryOptions::default())
        .await
        .unwrap();
    assert!(response.results.is_empty());

    let nodes = engine.graph_search_nodes("demo", "a.py", None).await.unwrap();
    assert!(nodes.is_empty(), "graph still references a.py: {:?}", nodes);
    let edges = engine.graph_search_edges("demo", "a.py").await.unwrap();
    assert!(edges.is_empty());

    let status = engine.indexer_status(Some("demo")).await.unwrap();
    assert_eq!(status.get("demo").unwrap().files_indexed, 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ignored_files_produce_no_tasks() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("keep.py"), "def keep(): return 1\n").unwrap();
    // the project ignore file exists before the engine starts
    let data_dir = tmp.path().join(".coderag");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("ignore"), "skipped.py\n").unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    std::fs::write(tmp.path().join("skipped.py"), "def hidden(): return 9\n").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // stores unchanged: only keep.py is known
    let status = engine.indexer_status(Some("demo")).await.unwrap();
    assert_eq!(status.get("demo").unwrap().files_indexed, 1);
    let response = engine
        .query("demo", "hidden", &QueryOptions::default())
        .await
        .unwrap();
    assert!(
        response.results.iter().all(|r| r.relative_path != "skipped.py"),
        "ignored file was indexed"
    );

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn parse_failure_falls_back_to_windows() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("broken.py"), "def (\nliteral_needle_here\n").unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    let response = engine
        .query("demo", "literal_needle_here", &QueryOptions::default())
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].kind, coderag::ChunkKind::Window);
    assert!(response.results[0].text.contains("literal_needle_here"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn embedder_flakiness_recovers() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.py"), "def f(): return 1\n").unwrap();

    // 503 twice, then the service recovers; the rescan retries the file
    let engine = engine_with_stub(StubEmbedder::with_transient_failures(2));
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    let status = engine.indexer_status(Some("demo")).await.unwrap();
    let status = status.get("demo").unwrap();
    assert_eq!(status.error_counts.transient, 2);
    assert!(status.last_commit_ts.is_some());

    // exactly one committed copy of the file's chunk
    let response = engine
        .query("demo", "return", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_roots_rejected() {
    let tmp = TempDir::new().unwrap();
    let nested = tmp.path().join("nested");
    std::fs::create_dir_all(&nested).unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("outer", tmp.path()).await.unwrap();

    let err = engine.add_project("inner", &nested).await.unwrap_err();
    assert!(err.is_user_error(), "expected validation error, got {}", err);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_project_is_input_error() {
    let engine = engine_with_stub(StubEmbedder::new());
    let err = engine
        .query("ghost", "anything", &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test(flavor = "multi_thread")]
async fn reinitialize_rebuilds_from_scratch() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.py"), "def f(): return 1\n").unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    engine.reinitialize_project("demo").await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    let response = engine
        .query("demo", "return", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_queries_are_stable() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("a.py"),
        "def alpha(): return 1\n\ndef beta(): return 2\n\ndef gamma(): return 3\n",
    )
    .unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    let first = engine
        .query("demo", "return value", &QueryOptions::default())
        .await
        .unwrap();
    let second = engine
        .query("demo", "return value", &QueryOptions::default())
        .await
        .unwrap();

    let ids = |response: &coderag::QueryResponse| {
        response
            .results
            .iter()
            .map(|r| r.chunk_id.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert!(!first.indexing_in_progress);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graph_context_attached_when_requested() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("calls.py"),
        "def helper():\n    return 1\n\ndef main():\n    return helper()\n",
    )
    .unwrap();

    let engine = engine_with_stub(StubEmbedder::new());
    engine.add_project("demo", tmp.path()).await.unwrap();
    wait_for_quiescence(&engine, "demo", 1).await;

    let options = QueryOptions {
        include_graph_context: true,
        ..QueryOptions::default()
    };
    let response = engine.query("demo", "main helper", &options).await.unwrap();

    let main_hit = response
        .results
        .iter()
        .find(|r| r.name.as_deref() == Some("main"))
        .expect("main not retrieved");
    assert!(
        main_hit
            .related
            .iter()
            .any(|r| r.name == "helper" && r.relation == "calls"),
        "missing calls neighbor: {:?}",
        main_hit.related
    );

    engine.shutdown().await;
}

// keep TaskKind referenced so the re-export stays honest
#[test]
fn task_kind_is_exported() {
    assert_ne!(TaskKind::Upsert, TaskKind::Delete);
}
