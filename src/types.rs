/// Core data model: chunks, index tasks, query requests and responses
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Kind of a chunk produced by the chunker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Module,
    Class,
    Function,
    Block,
    Section,
    Document,
    Window,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Class => "class",
            Self::Function => "function",
            Self::Block => "block",
            Self::Section => "section",
            Self::Document => "document",
            Self::Window => "window",
        }
    }
}

/// Typed metadata carried by every chunk
///
/// The open-ended `extra` map is reserved for language-specific fields
/// (JSON paths, heading levels, decorators) and stays small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub relative_path: String,
    pub language: Option<String>,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: String,
    pub indexed_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A contiguous, semantically meaningful slice of a file, indexed and
/// retrieved as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub parent_chunk_id: Option<String>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Deterministic chunk id: for a given file content and configuration
    /// the id set is a pure function of the chunker inputs.
    pub fn compute_id(
        relative_path: &str,
        kind: ChunkKind,
        name: Option<&str>,
        start_line: usize,
        end_line: usize,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(relative_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        match name {
            Some(name) => hasher.update(name.as_bytes()),
            None => hasher.update(start_line.to_string().as_bytes()),
        }
        hasher.update([0u8]);
        hasher.update(end_line.to_string().as_bytes());
        let digest = hasher.finalize();
        format!("{:x}", digest)[..32].to_string()
    }

    pub fn relative_path(&self) -> &str {
        &self.metadata.relative_path
    }

    pub fn kind(&self) -> ChunkKind {
        self.metadata.kind
    }
}

/// What a task asks the pipeline to do with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Upsert,
    Delete,
}

/// A unit of work bringing one file's stored representation up to date
///
/// `asserted_hash` is the content hash observed when the task was enqueued;
/// the pipeline re-reads and reloads the task if the file moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTask {
    pub project: String,
    pub relative_path: String,
    pub kind: TaskKind,
    pub asserted_hash: Option<String>,
}

impl IndexTask {
    pub fn upsert(project: &str, relative_path: &str, hash: Option<String>) -> Self {
        Self {
            project: project.to_string(),
            relative_path: relative_path.to_string(),
            kind: TaskKind::Upsert,
            asserted_hash: hash,
        }
    }

    pub fn delete(project: &str, relative_path: &str) -> Self {
        Self {
            project: project.to_string(),
            relative_path: relative_path.to_string(),
            kind: TaskKind::Delete,
            asserted_hash: None,
        }
    }
}

/// Options accepted by the query planner
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Number of results to return; falls back to `query.default_k`
    pub k: Option<usize>,
    /// Minimum similarity score; falls back to `query.min_score`
    pub min_score: Option<f32>,
    /// Metadata filters applied during the vector search
    pub filters: QueryFilters,
    /// Attach 1-hop graph neighborhoods to each hit
    pub include_graph_context: bool,
}

/// Metadata filters for vector search
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub languages: Vec<String>,
    pub kinds: Vec<ChunkKind>,
    pub path_prefixes: Vec<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.kinds.is_empty() && self.path_prefixes.is_empty()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if !self.languages.is_empty() {
            let lang = metadata.language.as_deref().unwrap_or("");
            if !self.languages.iter().any(|l| l == lang) {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&metadata.kind) {
            return false;
        }
        if !self.path_prefixes.is_empty()
            && !self
                .path_prefixes
                .iter()
                .any(|p| metadata.relative_path.starts_with(p.as_str()))
        {
            return false;
        }
        true
    }
}

/// A neighbor attached to a hit when graph context is requested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedNode {
    pub node_id: String,
    pub name: String,
    pub kind: String,
    pub file_path: String,
    pub relation: String,
}

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub relative_path: String,
    pub language: Option<String>,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedNode>,
}

/// Query planner output: ranked hits plus an assembled context string
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<ChunkHit>,
    pub context: String,
    /// Whether index tasks were pending or in flight when the query ran
    pub indexing_in_progress: bool,
}

/// Per-category error counters exposed through indexer_status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub transient: u64,
    pub permanent: u64,
}

/// Snapshot of a project's pipeline state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerStatus {
    pub queued: usize,
    pub in_flight: usize,
    pub last_commit_ts: Option<i64>,
    pub error_counts: ErrorCounts,
    pub files_indexed: usize,
    pub disabled: bool,
}
