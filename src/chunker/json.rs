//! JSON chunking: one chunk per top-level property
//!
//! A top-level array yields one chunk per element. Objects whose
//! serialization exceeds `max_chunk_size` are split one level further,
//! per key, with the pieces linked to the property chunk through
//! `parent_chunk_id`.

use super::{FileInput, make_chunk};
use crate::config::ChunkingConfig;
use crate::error::ChunkingError;
use crate::types::{Chunk, ChunkKind};
use serde_json::Value;
use std::collections::BTreeMap;

pub(super) fn chunk(
    file: &FileInput<'_>,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, ChunkingError> {
    let value: Value = serde_json::from_str(file.content)
        .map_err(|e| ChunkingError::ParseFailed(e.to_string()))?;

    let mut chunks = Vec::new();
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                emit_property(file, &key, &format!("$.{}", key), &value, None, config, &mut chunks);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                let name = format!("[{}]", index);
                emit_property(
                    file,
                    &name,
                    &format!("$[{}]", index),
                    value,
                    None,
                    config,
                    &mut chunks,
                );
            }
        }
        // scalar document: a single chunk for the whole value
        other => {
            let text = pretty(&other);
            let end_line = line_count(&text);
            let mut extra = BTreeMap::new();
            extra.insert("json_path".to_string(), "$".to_string());
            chunks.push(make_chunk(
                file,
                ChunkKind::Document,
                None,
                1,
                end_line,
                text,
                None,
                extra,
            ));
        }
    }
    Ok(chunks)
}

fn emit_property(
    file: &FileInput<'_>,
    name: &str,
    json_path: &str,
    value: &Value,
    parent_chunk_id: Option<String>,
    config: &ChunkingConfig,
    chunks: &mut Vec<Chunk>,
) {
    let text = pretty(value);
    let (start_line, end_line) = locate(file.content, name, &text);

    let mut extra = BTreeMap::new();
    extra.insert("json_path".to_string(), json_path.to_string());

    let chunk = make_chunk(
        file,
        ChunkKind::Block,
        Some(name.to_string()),
        start_line,
        end_line,
        text.clone(),
        parent_chunk_id,
        extra,
    );
    let own_id = chunk.chunk_id.clone();
    let oversized = text.len() > config.max_chunk_size;
    chunks.push(chunk);

    // one level deeper for oversized objects, per key
    if oversized && let Value::Object(map) = value {
        for (key, child) in map {
            emit_property(
                file,
                key,
                &format!("{}.{}", json_path, key),
                child,
                Some(own_id.clone()),
                config,
                chunks,
            );
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Best-effort line range: find the key's first occurrence in the source
fn locate(content: &str, name: &str, serialized: &str) -> (usize, usize) {
    let needle = format!("\"{}\"", name);
    let start_line = content
        .find(&needle)
        .map(|offset| content[..offset].matches('\n').count() + 1)
        .unwrap_or(1);
    (start_line, start_line + serialized.matches('\n').count())
}

fn line_count(text: &str) -> usize {
    text.matches('\n').count() + 1
}
