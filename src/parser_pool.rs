//! Leased tree-sitter parsers, one pool per registered language
//!
//! Parsers are not shareable across threads, so the pool hands each one
//! out under an exclusive lease and takes it back when the lease drops.
//! A parse failure is never fatal: callers fall back to sliding-window
//! chunking.

use crate::error::ChunkingError;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tree_sitter::{Language, Parser, Tree};

/// Grammar registry plus a free list of warmed-up parsers per language
pub struct ParserPool {
    languages: HashMap<&'static str, Language>,
    idle: Mutex<HashMap<String, Vec<Parser>>>,
}

impl ParserPool {
    /// Register the built-in grammar set
    pub fn new() -> Self {
        let mut languages: HashMap<&'static str, Language> = HashMap::new();
        languages.insert("rust", tree_sitter_rust::LANGUAGE.into());
        languages.insert("python", tree_sitter_python::LANGUAGE.into());
        languages.insert("javascript", tree_sitter_javascript::LANGUAGE.into());
        languages.insert(
            "typescript",
            tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        );
        languages.insert("go", tree_sitter_go::LANGUAGE.into());
        languages.insert("java", tree_sitter_java::LANGUAGE.into());
        languages.insert("c", tree_sitter_c::LANGUAGE.into());
        languages.insert("cpp", tree_sitter_cpp::LANGUAGE.into());

        Self {
            languages,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a grammar is registered for this language tag
    pub fn supports(&self, language: &str) -> bool {
        self.languages.contains_key(language)
    }

    /// Take an exclusive parser lease for a language
    pub fn lease(&self, language: &str) -> Result<ParserLease<'_>, ChunkingError> {
        let grammar = self
            .languages
            .get(language)
            .ok_or_else(|| ChunkingError::UnsupportedLanguage(language.to_string()))?;

        let reused = self
            .idle
            .lock()
            .expect("parser pool mutex poisoned")
            .get_mut(language)
            .and_then(|parsers| parsers.pop());

        let parser = match reused {
            Some(parser) => parser,
            None => {
                let mut parser = Parser::new();
                parser
                    .set_language(grammar)
                    .map_err(|e| ChunkingError::ParseFailed(e.to_string()))?;
                parser
            }
        };

        Ok(ParserLease {
            pool: self,
            language: language.to_string(),
            parser: Some(parser),
        })
    }

    fn release(&self, language: String, parser: Parser) {
        self.idle
            .lock()
            .expect("parser pool mutex poisoned")
            .entry(language)
            .or_default()
            .push(parser);
    }
}

impl Default for ParserPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on one parser; returned to the pool on drop
pub struct ParserLease<'a> {
    pool: &'a ParserPool,
    language: String,
    parser: Option<Parser>,
}

impl ParserLease<'_> {
    /// Parse source bytes into a syntax tree
    ///
    /// Trees containing ERROR nodes count as failures so that broken
    /// sources take the sliding-window path instead of producing garbage
    /// declaration chunks.
    pub fn parse(&mut self, source: &[u8]) -> Result<Tree, ChunkingError> {
        let parser = self.parser.as_mut().expect("lease already released");
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| ChunkingError::ParseFailed(format!("{} parser bailed", self.language)))?;
        if tree.root_node().has_error() {
            return Err(ChunkingError::ParseFailed(format!(
                "{} source contains syntax errors",
                self.language
            )));
        }
        Ok(tree)
    }
}

impl Drop for ParserLease<'_> {
    fn drop(&mut self) {
        if let Some(parser) = self.parser.take() {
            self.pool.release(std::mem::take(&mut self.language), parser);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_languages() {
        let pool = ParserPool::new();
        for lang in ["rust", "python", "javascript", "typescript", "go", "java", "c", "cpp"] {
            assert!(pool.supports(lang), "missing grammar for {}", lang);
        }
        assert!(!pool.supports("cobol"));
    }

    #[test]
    fn test_lease_unknown_language() {
        let pool = ParserPool::new();
        assert!(matches!(
            pool.lease("cobol"),
            Err(ChunkingError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_parse_python() {
        let pool = ParserPool::new();
        let mut lease = pool.lease("python").unwrap();
        let tree = lease.parse(b"def f():\n    return 1\n").unwrap();
        assert_eq!(tree.root_node().kind(), "module");
    }

    #[test]
    fn test_parse_broken_source_fails() {
        let pool = ParserPool::new();
        let mut lease = pool.lease("python").unwrap();
        assert!(matches!(
            lease.parse(b"def ("),
            Err(ChunkingError::ParseFailed(_))
        ));
    }

    #[test]
    fn test_parser_reuse_after_release() {
        let pool = ParserPool::new();
        {
            let mut lease = pool.lease("rust").unwrap();
            lease.parse(b"fn main() {}").unwrap();
        }
        // lease returned; the pool should now hold one idle rust parser
        assert_eq!(pool.idle.lock().unwrap().get("rust").map(|v| v.len()), Some(1));

        let mut lease = pool.lease("rust").unwrap();
        lease.parse(b"fn other() {}").unwrap();
        assert_eq!(pool.idle.lock().unwrap().get("rust").map(|v| v.len()), Some(0));
    }

    #[test]
    fn test_concurrent_leases_same_language() {
        let pool = ParserPool::new();
        let mut first = pool.lease("python").unwrap();
        let mut second = pool.lease("python").unwrap();
        assert!(first.parse(b"x = 1\n").is_ok());
        assert!(second.parse(b"y = 2\n").is_ok());
    }
}
