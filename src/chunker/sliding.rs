//! Sliding-window chunking for plain text and anything without a grammar
//!
//! Windows are `max_chunk_size` bytes, extended to the nearest line
//! boundary, with `chunk_overlap` bytes of overlap between consecutive
//! windows. Concatenating the windows in order after removing overlaps
//! reproduces the file exactly.

use super::{FileInput, make_chunk};
use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkKind};
use std::collections::BTreeMap;

pub(super) fn chunk(file: &FileInput<'_>, config: &ChunkingConfig) -> Vec<Chunk> {
    let content = file.content;
    if content.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    for (index, (start, end)) in window_spans(content, config).into_iter().enumerate() {
        let text = &content[start..end];
        let start_line = count_lines_before(content, start) + 1;
        let end_line = start_line + text.trim_end_matches('\n').matches('\n').count();

        let mut extra = BTreeMap::new();
        extra.insert("window_index".to_string(), index.to_string());

        chunks.push(make_chunk(
            file,
            ChunkKind::Window,
            None,
            start_line,
            end_line,
            text.to_string(),
            None,
            extra,
        ));
    }
    chunks
}

/// Byte ranges of the windows over `content`
///
/// Shared with the AST strategy's oversized-declaration splitting. Every
/// boundary lands on a UTF-8 character boundary; the end of each window
/// (except possibly the last) lands just past a newline.
pub(super) fn window_spans(content: &str, config: &ChunkingConfig) -> Vec<(usize, usize)> {
    let len = content.len();
    let mut spans = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = (start + config.max_chunk_size).min(len);
        end = ceil_char_boundary(content, end);

        // extend to the end of the current line
        while end < len && content.as_bytes()[end - 1] != b'\n' {
            end += 1;
            end = ceil_char_boundary(content, end);
        }

        spans.push((start, end));
        if end >= len {
            break;
        }

        let mut next = end.saturating_sub(config.chunk_overlap);
        next = ceil_char_boundary(content, next);
        if next <= start {
            next = end;
        }
        start = next;
    }

    spans
}

fn ceil_char_boundary(content: &str, mut offset: usize) -> usize {
    while offset < content.len() && !content.is_char_boundary(offset) {
        offset += 1;
    }
    offset
}

fn count_lines_before(text: &str, offset: usize) -> usize {
    text.as_bytes()[..offset.min(text.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
}
