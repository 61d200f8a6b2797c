//! Query planner: embed, search, enrich, rank, assemble context
//!
//! A query is lightly expanded (identifier-aware tokenization plus the
//! original form), each candidate embedded and the vectors averaged, then
//! an over-fetched k-NN pass runs against the vector store. Surviving
//! hits optionally pick up their 1-hop graph neighborhood, get re-ranked
//! with deterministic tie-breaks, and the top texts are concatenated into
//! a byte-bounded context string.

use crate::config::QueryConfig;
use crate::embedder::EmbeddingClient;
use crate::error::{EngineError, ValidationError};
use crate::graph_store::{Direction, GraphStore};
use crate::relations::NodeKind;
use crate::types::{ChunkHit, ChunkKind, QueryOptions, QueryResponse, RelatedNode};
use crate::vector_store::{VectorHit, VectorStore};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio_util::sync::CancellationToken;

pub struct QueryPlanner {
    config: QueryConfig,
    embedder: Arc<dyn EmbeddingClient>,
}

impl QueryPlanner {
    pub fn new(config: QueryConfig, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { config, embedder }
    }

    /// Run one query against a project's stores
    pub async fn query(
        &self,
        vector: &VectorStore,
        graph: &GraphStore,
        query_text: &str,
        options: &QueryOptions,
        indexing_in_progress: bool,
    ) -> Result<QueryResponse, EngineError> {
        if query_text.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }

        let k = options.k.unwrap_or(self.config.default_k).max(1);
        let min_score = options.min_score.unwrap_or(self.config.min_score);

        // expand, embed each candidate, average
        let candidates = expand_query(query_text);
        let cancel = CancellationToken::new();
        let scratch = AtomicU64::new(0);
        let vectors = self
            .embedder
            .embed(&candidates, &cancel, &scratch)
            .await
            .map_err(EngineError::Embedding)?;
        let query_vector = average(&vectors);
        if query_vector.is_empty() {
            return Ok(QueryResponse {
                results: Vec::new(),
                context: String::new(),
                indexing_in_progress,
            });
        }

        // over-fetch so filtering and dedup can still fill k
        let fetch = (k * 2).max(20);
        let mut hits: Vec<VectorHit> = vector
            .knn(&query_vector, fetch, &options.filters)?
            .into_iter()
            .filter(|hit| hit.score >= min_score)
            .collect();

        rank(&mut hits);
        hits.truncate(k);

        let results: Vec<ChunkHit> = hits
            .into_iter()
            .map(|hit| {
                let related = if options.include_graph_context {
                    graph_context(graph, &hit)
                } else {
                    Vec::new()
                };
                ChunkHit {
                    chunk_id: hit.chunk_id,
                    score: hit.score,
                    text: hit.text,
                    relative_path: hit.metadata.relative_path,
                    language: hit.metadata.language,
                    kind: hit.metadata.kind,
                    name: hit.metadata.name,
                    start_line: hit.metadata.start_line,
                    end_line: hit.metadata.end_line,
                    related,
                }
            })
            .collect();

        let context = build_context(&results, self.config.context_budget);

        Ok(QueryResponse {
            results,
            context,
            indexing_in_progress,
        })
    }
}

/// Normalize and lightly expand: the original form plus an
/// identifier-split form (underscores and camel-case boundaries)
pub(crate) fn expand_query(query_text: &str) -> Vec<String> {
    let stripped: String = query_text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let original = stripped.trim().to_string();

    let tokenized = original
        .split_whitespace()
        .flat_map(|word| split_identifier(word))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut candidates = vec![original.clone()];
    if !tokenized.is_empty() && tokenized != original.to_lowercase() {
        candidates.push(tokenized);
    }
    candidates.retain(|c| !c.is_empty());
    candidates
}

/// Split one token on `_` and lower-to-upper camel boundaries
fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for piece in word.split('_') {
        let mut current = String::new();
        let mut previous_lower = false;
        for c in piece.chars() {
            if c.is_uppercase() && previous_lower && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            previous_lower = c.is_lowercase();
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current);
        }
    }
    parts
}

fn average(vectors: &[Vec<f32>]) -> Vec<f32> {
    match vectors {
        [] => Vec::new(),
        [single] => single.clone(),
        _ => {
            let dimension = vectors[0].len();
            let mut out = vec![0.0; dimension];
            for vector in vectors {
                for (slot, value) in out.iter_mut().zip(vector) {
                    *slot += value;
                }
            }
            let n = vectors.len() as f32;
            for slot in &mut out {
                *slot /= n;
            }
            out
        }
    }
}

/// Primary key vector score; ties break by path then start line; hits
/// whose text is a strict substring of a higher-ranked hit from the same
/// file sink to the bottom
pub(crate) fn rank(hits: &mut Vec<VectorHit>) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.metadata.relative_path.cmp(&b.metadata.relative_path))
            .then_with(|| a.metadata.start_line.cmp(&b.metadata.start_line))
    });

    let mut demoted = vec![false; hits.len()];
    for i in 0..hits.len() {
        for j in 0..i {
            if demoted[j] {
                continue;
            }
            if hits[i].metadata.relative_path == hits[j].metadata.relative_path
                && hits[i].text.len() < hits[j].text.len()
                && hits[j].text.contains(&hits[i].text)
            {
                demoted[i] = true;
                break;
            }
        }
    }

    let mut kept = Vec::with_capacity(hits.len());
    let mut sunk = Vec::new();
    for (hit, is_demoted) in hits.drain(..).zip(demoted) {
        if is_demoted {
            sunk.push(hit);
        } else {
            kept.push(hit);
        }
    }
    kept.extend(sunk);
    *hits = kept;
}

/// 1-hop neighborhood of the graph node behind a hit
fn graph_context(graph: &GraphStore, hit: &VectorHit) -> Vec<RelatedNode> {
    let node_id = resolve_node_id(graph, hit);
    let Some(node_id) = node_id else {
        return Vec::new();
    };

    graph
        .neighbors(&node_id, Direction::Both, None)
        .into_iter()
        .map(|neighbor| RelatedNode {
            node_id: neighbor.node.node_id,
            name: neighbor.node.name,
            kind: neighbor.node.kind.as_str().to_string(),
            file_path: neighbor.node.file_path,
            relation: neighbor.relation.as_str().to_string(),
        })
        .collect()
}

/// Find the graph node matching a chunk: named declaration first, then
/// the file's module node
fn resolve_node_id(graph: &GraphStore, hit: &VectorHit) -> Option<String> {
    let kind = match hit.metadata.kind {
        ChunkKind::Function => Some(NodeKind::Function),
        ChunkKind::Class => Some(NodeKind::Class),
        _ => None,
    };
    if let (Some(kind), Some(name)) = (kind, hit.metadata.name.as_deref()) {
        let matched = graph
            .search_nodes(name, Some(kind))
            .into_iter()
            .find(|n| n.file_path == hit.metadata.relative_path && n.name == name);
        if let Some(node) = matched {
            return Some(node.node_id);
        }
    }
    let module_id = crate::relations::module_node_id(&hit.metadata.relative_path);
    graph.get_node(&module_id).map(|n| n.node_id)
}

/// Concatenate ranked hits into a `path:start-end`-prefixed context
/// string bounded by `budget` bytes
pub(crate) fn build_context(results: &[ChunkHit], budget: usize) -> String {
    let mut context = String::new();
    for hit in results {
        let header = format!(
            "--- {}:{}-{} ---\n",
            hit.relative_path, hit.start_line, hit.end_line
        );
        let addition = header.len() + hit.text.len() + 2;
        if !context.is_empty() && context.len() + addition > budget {
            break;
        }
        if context.len() + addition > budget && context.is_empty() {
            // always include at least a truncated first hit
            context.push_str(&header);
            let available = budget.saturating_sub(context.len());
            let mut cut = available.min(hit.text.len());
            while cut > 0 && !hit.text.is_char_boundary(cut) {
                cut -= 1;
            }
            context.push_str(&hit.text[..cut]);
            break;
        }
        context.push_str(&header);
        context.push_str(&hit.text);
        context.push_str("\n\n");
    }
    context
}
