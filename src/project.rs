//! Per-project identity and on-disk layout
//!
//! Each watched project owns a hidden data directory under its root:
//!
//! ```text
//! <root>/.coderag/
//!     hash_cache.json   persistent hash cache
//!     vector/           vector store collection
//!     graph.json        graph store
//!     ignore            per-project ignore patterns (gitignore syntax)
//!     lock              advisory flock, held while the engine owns the project
//! ```

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Name of the hidden per-project data directory
pub const DATA_DIR_NAME: &str = ".coderag";

/// A registered project: name, canonical root, derived data dir
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub root_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Project {
    pub fn new(name: impl Into<String>, root_path: impl AsRef<Path>) -> Self {
        let root_path = root_path.as_ref().to_path_buf();
        let data_dir = root_path.join(DATA_DIR_NAME);
        Self {
            name: name.into(),
            root_path,
            data_dir,
        }
    }

    pub fn hash_cache_path(&self) -> PathBuf {
        self.data_dir.join("hash_cache.json")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vector")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join("graph.json")
    }

    pub fn ignore_file_path(&self) -> PathBuf {
        self.data_dir.join("ignore")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("lock")
    }

    /// Create the data directory skeleton if missing
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).context("Failed to create project data directory")?;
        fs::create_dir_all(self.vector_dir()).context("Failed to create vector directory")?;
        Ok(())
    }

    /// Erase the data directory entirely; the next scan rebuilds it
    pub fn erase_data_dir(&self) -> Result<()> {
        if self.data_dir.exists() {
            fs::remove_dir_all(&self.data_dir).context("Failed to erase project data directory")?;
        }
        Ok(())
    }

    /// Convert an absolute path under the root into a repo-relative string
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root_path)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    /// Absolute path for a repo-relative string
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root_path.join(relative)
    }
}

/// Guard holding an exclusive advisory lock on a project's data dir
///
/// Released on drop; the OS releases the flock if the process crashes.
pub struct ProjectLock {
    _file: File,
}

impl ProjectLock {
    /// Acquire the lock, failing fast if another engine owns the project
    pub fn acquire(project: &Project) -> Result<Self> {
        project.ensure_layout()?;
        let path = project.lock_path();
        let file = File::create(&path).context("Failed to create project lock file")?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "Project '{}' is locked by another process ({})",
                project.name,
                path.display()
            )
        })?;
        tracing::debug!("Acquired project lock: {}", path.display());
        Ok(Self { _file: file })
    }
}

/// Reject roots that contain or are contained by an already-registered root
pub fn roots_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_paths() {
        let project = Project::new("demo", "/work/demo");
        assert_eq!(project.data_dir, PathBuf::from("/work/demo/.coderag"));
        assert_eq!(
            project.hash_cache_path(),
            PathBuf::from("/work/demo/.coderag/hash_cache.json")
        );
        assert_eq!(
            project.vector_dir(),
            PathBuf::from("/work/demo/.coderag/vector")
        );
        assert_eq!(
            project.graph_path(),
            PathBuf::from("/work/demo/.coderag/graph.json")
        );
    }

    #[test]
    fn test_ensure_and_erase_layout() {
        let tmp = tempdir().unwrap();
        let project = Project::new("demo", tmp.path());

        project.ensure_layout().unwrap();
        assert!(project.data_dir.exists());
        assert!(project.vector_dir().exists());

        project.erase_data_dir().unwrap();
        assert!(!project.data_dir.exists());
    }

    #[test]
    fn test_relative_path() {
        let project = Project::new("demo", "/work/demo");
        assert_eq!(
            project.relative_path(Path::new("/work/demo/src/main.rs")),
            Some("src/main.rs".to_string())
        );
        assert_eq!(project.relative_path(Path::new("/elsewhere/x.rs")), None);
    }

    #[test]
    fn test_roots_overlap() {
        assert!(roots_overlap(Path::new("/a/b"), Path::new("/a/b/c")));
        assert!(roots_overlap(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(roots_overlap(Path::new("/a"), Path::new("/a")));
        assert!(!roots_overlap(Path::new("/a/b"), Path::new("/a/bc")));
        assert!(!roots_overlap(Path::new("/x"), Path::new("/y")));
    }

    #[test]
    fn test_project_lock_exclusive() {
        let tmp = tempdir().unwrap();
        let project = Project::new("demo", tmp.path());

        let first = ProjectLock::acquire(&project).unwrap();
        assert!(ProjectLock::acquire(&project).is_err());
        drop(first);
        assert!(ProjectLock::acquire(&project).is_ok());
    }
}
