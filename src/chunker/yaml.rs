//! YAML chunking: one chunk per `---`-separated document
//!
//! Documents are split textually on separator lines rather than through a
//! YAML parser; malformed YAML still chunks and still retrieves.

use super::{FileInput, make_chunk};
use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkKind};
use std::collections::BTreeMap;

pub(super) fn chunk(file: &FileInput<'_>, _config: &ChunkingConfig) -> Vec<Chunk> {
    let lines: Vec<&str> = file.content.lines().collect();

    // separator line indexes, bracketed by virtual markers at both ends
    let mut boundaries = vec![-1i64];
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == "---" {
            boundaries.push(i as i64);
        }
    }
    boundaries.push(lines.len() as i64);

    let mut chunks = Vec::new();
    for (doc_index, pair) in boundaries.windows(2).enumerate() {
        let start = (pair[0] + 1) as usize;
        let end = pair[1] as usize;
        if start >= end {
            continue;
        }
        let text = lines[start..end].join("\n");
        if text.trim().is_empty() {
            continue;
        }

        let mut extra = BTreeMap::new();
        extra.insert("document_index".to_string(), doc_index.to_string());

        chunks.push(make_chunk(
            file,
            ChunkKind::Document,
            Some(format!("document_{}", doc_index)),
            start + 1,
            end,
            text,
            None,
            extra,
        ));
    }
    chunks
}
