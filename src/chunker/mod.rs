//! Language-aware chunking: one strategy per language class
//!
//! The strategy set is a closed enum dispatched here; per-language behavior
//! lives in the submodules. AST chunking degrades to sliding windows when a
//! file fails to parse, so every file yields chunks.

mod ast;
mod json;
mod markdown;
mod sliding;
mod yaml;

use crate::config::ChunkingConfig;
use crate::parser_pool::ParserPool;
use crate::types::{Chunk, ChunkKind, ChunkMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a file is cut into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Ast,
    SlidingWindow,
    JsonObject,
    YamlDocument,
    MarkdownSection,
}

impl Strategy {
    /// Parse a configured strategy name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ast" => Some(Self::Ast),
            "sliding_window" => Some(Self::SlidingWindow),
            "json_object" => Some(Self::JsonObject),
            "yaml_document" => Some(Self::YamlDocument),
            "markdown_section" => Some(Self::MarkdownSection),
            _ => None,
        }
    }
}

/// A file handed to the chunker
#[derive(Debug, Clone)]
pub struct FileInput<'a> {
    pub relative_path: &'a str,
    pub language: Option<&'a str>,
    pub content: &'a str,
    pub content_hash: &'a str,
}

/// Turns files into ordered chunk lists
pub struct Chunker {
    config: ChunkingConfig,
    pool: Arc<ParserPool>,
}

impl Chunker {
    pub fn new(config: ChunkingConfig, pool: Arc<ParserPool>) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk a file with the given strategy
    ///
    /// Deterministic for fixed content and configuration: chunk ids derive
    /// from stable positions and names, never from timestamps or counters.
    pub fn chunk_file(&self, file: &FileInput<'_>, strategy: Strategy) -> Vec<Chunk> {
        if file.content.is_empty() {
            return Vec::new();
        }

        match strategy {
            Strategy::Ast => {
                let language = match file.language {
                    Some(language) if self.pool.supports(language) => language,
                    _ => {
                        tracing::debug!(
                            "No grammar for {:?}, windowing {}",
                            file.language,
                            file.relative_path
                        );
                        return sliding::chunk(file, &self.config);
                    }
                };
                match ast::chunk(file, language, &self.pool, &self.config) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        tracing::debug!(
                            "AST chunking failed for {} ({}), falling back to sliding window",
                            file.relative_path,
                            e
                        );
                        sliding::chunk(file, &self.config)
                    }
                }
            }
            Strategy::SlidingWindow => sliding::chunk(file, &self.config),
            Strategy::JsonObject => match json::chunk(file, &self.config) {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::debug!(
                        "JSON chunking failed for {} ({}), falling back to sliding window",
                        file.relative_path,
                        e
                    );
                    sliding::chunk(file, &self.config)
                }
            },
            Strategy::YamlDocument => yaml::chunk(file, &self.config),
            Strategy::MarkdownSection => markdown::chunk(file, &self.config),
        }
    }
}

/// Shared constructor used by every strategy
pub(crate) fn make_chunk(
    file: &FileInput<'_>,
    kind: ChunkKind,
    name: Option<String>,
    start_line: usize,
    end_line: usize,
    text: String,
    parent_chunk_id: Option<String>,
    extra: BTreeMap<String, String>,
) -> Chunk {
    let chunk_id = Chunk::compute_id(
        file.relative_path,
        kind,
        name.as_deref(),
        start_line,
        end_line,
    );
    Chunk {
        chunk_id,
        text,
        parent_chunk_id,
        metadata: ChunkMetadata {
            relative_path: file.relative_path.to_string(),
            language: file.language.map(|l| l.to_string()),
            kind,
            name,
            start_line,
            end_line,
            content_hash: file.content_hash.to_string(),
            indexed_at: chrono::Utc::now().timestamp(),
            extra,
        },
    }
}
