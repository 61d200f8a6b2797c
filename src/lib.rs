//! # coderag - Code-Aware RAG Indexing and Retrieval Engine
//!
//! Watches local source trees, chunks files along syntactic boundaries,
//! embeds the chunks through an external embedding service, and serves
//! ranked semantic search enriched with a code-relationship graph.
//!
//! ## Overview
//!
//! Each registered project owns a hidden `.coderag/` directory holding its
//! hash cache, vector collection, graph store and ignore file. A watcher
//! debounces filesystem events into index tasks; a bounded worker pool
//! chunks, embeds and commits them file-atomically into the two stores;
//! the query planner combines k-NN search with graph neighborhood
//! expansion.
//!
//! The HTTP API, UI and agent bridges are external collaborators: they
//! hand the engine a [`Config`] value object and call the operations on
//! [`Engine`].
//!
//! ## Library Usage Example
//!
//! ```no_run
//! use coderag::{Config, Engine, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), coderag::EngineError> {
//!     let engine = Engine::new(Config::default())?;
//!     engine.add_project("demo", std::path::Path::new("/path/to/repo")).await?;
//!
//!     let response = engine
//!         .query("demo", "where is the retry logic", &QueryOptions::default())
//!         .await?;
//!     for hit in &response.results {
//!         println!("{}:{} ({:.2})", hit.relative_path, hit.start_line, hit.score);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: project lifecycle, reindex, query and status operations
//! - [`watcher`]: per-project filesystem observation and reconciliation
//! - [`pipeline`]: the bounded worker pool committing index tasks
//! - [`chunker`]: strategy-per-language chunking
//! - [`relations`]: graph node and edge extraction
//! - [`embedder`]: batched client for the embedding endpoint
//! - [`vector_store`] / [`graph_store`]: the per-project stores
//! - [`query`]: the query planner

/// Configuration value object consumed by the engine
pub mod config;

/// Error taxonomy
pub mod error;

/// Strategy-per-language chunking
pub mod chunker;

/// Batched embedding endpoint client
pub mod embedder;

/// Engine facade and project registry
pub mod engine;

/// Per-project persistent code-relationship graph
pub mod graph_store;

/// Persistent per-project hash cache
pub mod hash_cache;

/// Layered gitignore-style filtering
pub mod ignore_rules;

/// Leased tree-sitter parsers
pub mod parser_pool;

/// Index task processing and commit ordering
pub mod pipeline;

/// Project identity and on-disk layout
pub mod project;

/// Query planning and ranking
pub mod query;

/// Graph node and edge extraction
pub mod relations;

/// Core data model: chunks, tasks, queries
pub mod types;

/// Per-project usearch vector collection
pub mod vector_store;

/// Filesystem watching and reconciliation scans
pub mod watcher;

pub use config::Config;
pub use embedder::{EmbeddingClient, HttpEmbedder};
pub use engine::Engine;
pub use error::EngineError;
pub use graph_store::{Direction, GraphDiff, GraphStore, NeighborHit};
pub use project::Project;
pub use relations::{GraphEdge, GraphNode, NodeKind, Relation};
pub use types::{
    Chunk, ChunkHit, ChunkKind, ChunkMetadata, IndexTask, IndexerStatus, QueryFilters,
    QueryOptions, QueryResponse, TaskKind,
};
pub use vector_store::VectorStore;
