//! Layered gitignore-style filtering for project scans and watch events
//!
//! Patterns are compiled from three ordered sources so that gitignore
//! semantics (last match wins, `!` negates) hold across layers:
//! engine defaults, then `indexer.ignore_patterns` from configuration,
//! then the project's `.coderag/ignore` file. Binary and data-file
//! extensions from configuration are always ignored regardless of
//! negations. Readers hold an immutable snapshot per scan; the watcher
//! rebuilds the snapshot when a source file changes.

use crate::config::IndexerConfig;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Patterns every project starts with; the data dir must never index itself
const DEFAULT_PATTERNS: &[&str] = &[
    ".git/",
    ".coderag/",
    ".hg/",
    ".svn/",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    "__pycache__/",
    ".venv/",
    "venv/",
    "*.min.js",
    "*.lock",
];

/// Immutable ignore snapshot for one project
pub struct IgnoreRules {
    matcher: Gitignore,
    binary_extensions: GlobSet,
}

impl IgnoreRules {
    /// Compile the layered pattern sources for a project root
    ///
    /// `project_ignore_file` is read if it exists; a missing file is not an
    /// error (new projects have none until the user writes one).
    pub fn build(
        root: &Path,
        indexer: &IndexerConfig,
        project_ignore_file: &Path,
    ) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);

        for pattern in DEFAULT_PATTERNS {
            builder
                .add_line(None, pattern)
                .with_context(|| format!("Invalid default ignore pattern: {}", pattern))?;
        }
        for pattern in &indexer.ignore_patterns {
            builder
                .add_line(None, pattern)
                .with_context(|| format!("Invalid configured ignore pattern: {}", pattern))?;
        }
        if project_ignore_file.is_file() {
            // add() returns a non-fatal partial error; surface it as a warning
            if let Some(err) = builder.add(project_ignore_file) {
                tracing::warn!(
                    "Errors in project ignore file {}: {}",
                    project_ignore_file.display(),
                    err
                );
            }
        }

        let matcher = builder.build().context("Failed to compile ignore rules")?;

        let mut ext_builder = GlobSetBuilder::new();
        for ext in &indexer.binary_extensions {
            let glob = Glob::new(&format!("*.{}", ext))
                .with_context(|| format!("Invalid binary extension glob: {}", ext))?;
            ext_builder.add(glob);
        }
        let binary_extensions = ext_builder
            .build()
            .context("Failed to compile binary extension set")?;

        Ok(Self {
            matcher,
            binary_extensions,
        })
    }

    /// Whether a repo-relative path is excluded from indexing
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        if !is_dir {
            if let Some(file_name) = Path::new(relative_path).file_name()
                && self.binary_extensions.is_match(Path::new(file_name))
            {
                return true;
            }
        }
        self.matcher
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }
}

/// Whether an absolute path is a symlink whose target escapes the root
///
/// Symlinks pointing outside the project are never indexed.
pub fn symlink_escapes_root(path: &Path, root: &Path) -> bool {
    let Ok(metadata) = path.symlink_metadata() else {
        return false;
    };
    if !metadata.file_type().is_symlink() {
        return false;
    }
    match path.canonicalize() {
        Ok(resolved) => {
            let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
            !resolved.starts_with(&root)
        }
        // broken symlink
        Err(_) => true,
    }
}
