//! Markdown chunking: one chunk per heading section
//!
//! Sub-headings nest through `parent_chunk_id` following the heading
//! levels; content before the first heading becomes a preamble section.
//! A file without headings is a single section chunk.

use super::{FileInput, make_chunk};
use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkKind};
use std::collections::BTreeMap;

struct Heading {
    line_index: usize,
    level: usize,
    title: String,
}

pub(super) fn chunk(file: &FileInput<'_>, _config: &ChunkingConfig) -> Vec<Chunk> {
    let lines: Vec<&str> = file.content.lines().collect();
    let headings = find_headings(&lines);

    if headings.is_empty() {
        if file.content.trim().is_empty() {
            return Vec::new();
        }
        return vec![make_chunk(
            file,
            ChunkKind::Section,
            None,
            1,
            lines.len().max(1),
            file.content.to_string(),
            None,
            BTreeMap::new(),
        )];
    }

    let mut chunks = Vec::new();

    // preamble before the first heading
    if headings[0].line_index > 0 {
        let text = lines[..headings[0].line_index].join("\n");
        if !text.trim().is_empty() {
            chunks.push(make_chunk(
                file,
                ChunkKind::Section,
                None,
                1,
                headings[0].line_index,
                text,
                None,
                BTreeMap::new(),
            ));
        }
    }

    // stack of (level, chunk_id) tracking the enclosing heading chain
    let mut stack: Vec<(usize, String)> = Vec::new();

    for (i, heading) in headings.iter().enumerate() {
        let start = heading.line_index;
        let end = headings
            .get(i + 1)
            .map(|next| next.line_index)
            .unwrap_or(lines.len());
        let text = lines[start..end].join("\n");

        while let Some((level, _)) = stack.last() {
            if *level >= heading.level {
                stack.pop();
            } else {
                break;
            }
        }
        let parent = stack.last().map(|(_, id)| id.clone());

        let mut extra = BTreeMap::new();
        extra.insert("heading_level".to_string(), heading.level.to_string());

        let chunk = make_chunk(
            file,
            ChunkKind::Section,
            Some(heading.title.clone()),
            start + 1,
            end,
            text,
            parent,
            extra,
        );
        stack.push((heading.level, chunk.chunk_id.clone()));
        chunks.push(chunk);
    }

    chunks
}

fn find_headings(lines: &[&str]) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut in_fence = false;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || !line.starts_with('#') {
            continue;
        }
        let level = line.chars().take_while(|&c| c == '#').count();
        // a real ATX heading needs a space after the hashes
        if level == 0 || level > 6 || line.len() <= level || !line[level..].starts_with(' ') {
            continue;
        }
        headings.push(Heading {
            line_index: i,
            level,
            title: line[level + 1..].trim().to_string(),
        });
    }
    headings
}
