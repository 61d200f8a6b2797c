//! AST chunking: one chunk per top-level declaration
//!
//! Classes recurse into their methods (methods carry `parent_chunk_id`),
//! declarations smaller than `min_chunk_size` merge upward into the module
//! header chunk, and oversized declarations split into windows that keep
//! the declaration's kind and name.

use super::{FileInput, make_chunk, sliding};
use crate::config::ChunkingConfig;
use crate::error::ChunkingError;
use crate::parser_pool::ParserPool;
use crate::types::{Chunk, ChunkKind};
use std::collections::BTreeMap;
use tree_sitter::Node;

/// How a declaration node participates in chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeClass {
    /// Function-like: emitted as a single Function chunk
    Function,
    /// Container: emitted as a Class chunk, then recursed for methods
    Container,
}

pub(super) fn chunk(
    file: &FileInput<'_>,
    language: &str,
    pool: &ParserPool,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, ChunkingError> {
    let mut lease = pool.lease(language)?;
    let tree = lease.parse(file.content.as_bytes())?;
    let root = tree.root_node();

    let mut chunks = Vec::new();
    // Byte ranges of declarations emitted as their own chunks; whatever is
    // left over becomes the module header chunk.
    let mut covered: Vec<(usize, usize)> = Vec::new();

    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        let node = unwrap_wrapper(language, child);
        let Some(class) = classify(language, node.kind()) else {
            continue;
        };
        let span = child.byte_range();
        if span.len() < config.min_chunk_size {
            // merged upward into the header chunk
            continue;
        }
        covered.push((span.start, span.end));
        emit_declaration(file, language, node, child, class, None, config, &mut chunks);
    }

    covered.sort_unstable();
    if let Some(header) = header_chunk(file, &covered) {
        chunks.insert(0, header);
    }

    Ok(chunks)
}

/// Emit a declaration chunk, splitting oversized nodes into windows and
/// recursing into containers for their methods.
///
/// `span_node` is the outermost node (includes decorators/export wrappers);
/// `node` is the unwrapped declaration used for classification and naming.
#[allow(clippy::too_many_arguments)]
fn emit_declaration(
    file: &FileInput<'_>,
    language: &str,
    node: Node<'_>,
    span_node: Node<'_>,
    class: NodeClass,
    parent_chunk_id: Option<String>,
    config: &ChunkingConfig,
    chunks: &mut Vec<Chunk>,
) {
    let kind = match class {
        NodeClass::Function => ChunkKind::Function,
        NodeClass::Container => ChunkKind::Class,
    };
    let name = node_name(node, file.content);
    let text = &file.content[span_node.byte_range()];
    let start_line = span_node.start_position().row + 1;
    let end_line = span_node.end_position().row + 1;

    let own_id = if text.len() > config.max_chunk_size {
        split_oversized(
            file,
            kind,
            name.clone(),
            text,
            start_line,
            parent_chunk_id.clone(),
            config,
            chunks,
        )
    } else {
        let chunk = make_chunk(
            file,
            kind,
            name,
            start_line,
            end_line,
            text.to_string(),
            parent_chunk_id.clone(),
            BTreeMap::new(),
        );
        let id = chunk.chunk_id.clone();
        chunks.push(chunk);
        Some(id)
    };

    if class == NodeClass::Container {
        let parent = own_id.or(parent_chunk_id);
        recurse_members(file, language, node, &parent, config, chunks);
    }
}

/// Depth-first, in-order walk below a container emitting nested
/// declarations with the container as their parent
fn recurse_members(
    file: &FileInput<'_>,
    language: &str,
    node: Node<'_>,
    parent: &Option<String>,
    config: &ChunkingConfig,
    chunks: &mut Vec<Chunk>,
) {
    let mut cursor = node.walk();
    for candidate in node.children(&mut cursor) {
        let inner = unwrap_wrapper(language, candidate);
        match classify(language, inner.kind()) {
            Some(inner_class) => {
                // members below min size stay merged into the container text
                if candidate.byte_range().len() >= config.min_chunk_size {
                    emit_declaration(
                        file,
                        language,
                        inner,
                        candidate,
                        inner_class,
                        parent.clone(),
                        config,
                        chunks,
                    );
                }
            }
            None => recurse_members(file, language, candidate, parent, config, chunks),
        }
    }
}

/// Window-split an oversized declaration, keeping its kind and name on
/// every piece. Returns the first window's id to act as the parent for
/// recursed methods.
#[allow(clippy::too_many_arguments)]
fn split_oversized(
    file: &FileInput<'_>,
    kind: ChunkKind,
    name: Option<String>,
    text: &str,
    node_start_line: usize,
    parent_chunk_id: Option<String>,
    config: &ChunkingConfig,
    chunks: &mut Vec<Chunk>,
) -> Option<String> {
    let mut first_id = None;
    for (index, (start, end)) in sliding::window_spans(text, config).into_iter().enumerate() {
        let window_text = &text[start..end];
        let start_line = node_start_line + count_lines_before(text, start);
        let end_line = start_line + window_text.matches('\n').count();

        let mut extra = BTreeMap::new();
        extra.insert("window_index".to_string(), index.to_string());

        let chunk = make_chunk(
            file,
            kind,
            name.clone(),
            start_line,
            end_line,
            window_text.to_string(),
            parent_chunk_id.clone(),
            extra,
        );
        if first_id.is_none() {
            first_id = Some(chunk.chunk_id.clone());
        }
        chunks.push(chunk);
    }
    first_id
}

/// Collect top-level content not covered by emitted declarations into one
/// Module chunk (imports, constants, merged-up small declarations).
fn header_chunk(file: &FileInput<'_>, covered: &[(usize, usize)]) -> Option<Chunk> {
    let content = file.content;
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut offset = 0;
    for &(start, end) in covered {
        if offset < start {
            segments.push((offset, start));
        }
        offset = offset.max(end);
    }
    if offset < content.len() {
        segments.push((offset, content.len()));
    }

    let text = segments
        .iter()
        .map(|&(s, e)| content[s..e].trim_matches('\n'))
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return None;
    }

    let first = segments
        .iter()
        .find(|&&(s, e)| !content[s..e].trim().is_empty())?;
    let last = segments
        .iter()
        .rev()
        .find(|&&(s, e)| !content[s..e].trim().is_empty())?;
    let start_line = count_lines_before(content, first.0) + 1;
    let end_line = count_lines_before(content, last.1.saturating_sub(1)) + 1;

    Some(make_chunk(
        file,
        ChunkKind::Module,
        None,
        start_line,
        end_line,
        text,
        None,
        BTreeMap::new(),
    ))
}

fn count_lines_before(text: &str, offset: usize) -> usize {
    text.as_bytes()[..offset.min(text.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
}

/// Skip decorator/export wrappers down to the declaration they wrap
fn unwrap_wrapper<'t>(language: &str, node: Node<'t>) -> Node<'t> {
    match (language, node.kind()) {
        ("python", "decorated_definition") => node
            .child_by_field_name("definition")
            .unwrap_or(node),
        ("javascript" | "typescript", "export_statement") => node
            .child_by_field_name("declaration")
            .unwrap_or(node),
        _ => node,
    }
}

fn classify(language: &str, kind: &str) -> Option<NodeClass> {
    use NodeClass::{Container, Function};
    let class = match (language, kind) {
        ("rust", "function_item") => Function,
        (
            "rust",
            "struct_item" | "enum_item" | "trait_item" | "impl_item" | "mod_item" | "union_item",
        ) => Container,

        ("python", "function_definition") => Function,
        ("python", "class_definition") => Container,

        (
            "javascript" | "typescript",
            "function_declaration" | "generator_function_declaration" | "method_definition",
        ) => Function,
        ("javascript" | "typescript", "class_declaration") => Container,

        ("go", "function_declaration" | "method_declaration") => Function,
        ("go", "type_declaration") => Container,

        ("java", "method_declaration" | "constructor_declaration") => Function,
        ("java", "class_declaration" | "interface_declaration" | "enum_declaration") => Container,

        ("c" | "cpp", "function_definition") => Function,
        ("c", "struct_specifier" | "enum_specifier" | "union_specifier" | "type_definition") => {
            Container
        }
        (
            "cpp",
            "class_specifier" | "struct_specifier" | "enum_specifier" | "union_specifier"
            | "namespace_definition" | "template_declaration",
        ) => Container,

        _ => return None,
    };
    Some(class)
}

/// Best-effort declaration name via grammar name fields
fn node_name(node: Node<'_>, source: &str) -> Option<String> {
    for field in ["name", "type", "declarator"] {
        if let Some(name_node) = node.child_by_field_name(field) {
            let raw = &source[name_node.byte_range()];
            // C declarators carry parameter lists; keep the identifier only
            let name = raw.split('(').next().unwrap_or(raw).trim();
            let name = name.trim_start_matches('*').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}
