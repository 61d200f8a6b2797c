//! Persistent per-project hash cache
//!
//! Maps repo-relative paths to the content hash, size and mtime observed
//! at the last successful commit. A record exists iff the file was indexed
//! at that hash, which makes the cache the source of truth for crash
//! recovery: the pipeline updates it last, so any commit that died partway
//! leaves the file looking unindexed and the reconciliation scan retries.
//!
//! Writes go through a temp file and an atomic rename so an unclean
//! shutdown can never leave a torn cache on disk.

use crate::error::{CacheError, EngineError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// What the cache remembers about one indexed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content_hash: String,
    pub size: u64,
    /// Modification time as seconds since the epoch
    pub mtime: i64,
    pub language: Option<String>,
    pub last_indexed_at: i64,
}

/// Persistent mapping from relative path to file record
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HashCache {
    files: HashMap<String, FileRecord>,

    #[serde(skip)]
    path: PathBuf,
}

impl HashCache {
    /// Load the cache from disk, or start empty when the file is missing
    ///
    /// A present-but-unparseable file is corruption: the project is
    /// disabled until reinitialize_project erases the data dir.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            tracing::debug!("Hash cache not found at {}, starting empty", path.display());
            return Ok(Self {
                files: HashMap::new(),
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| CacheError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut cache: HashCache = serde_json::from_str(&content)
            .map_err(|e| CacheError::Corrupted(format!("{}: {}", path.display(), e)))?;
        cache.path = path.to_path_buf();

        tracing::info!(
            "Loaded hash cache with {} files from {}",
            cache.files.len(),
            path.display()
        );
        Ok(cache)
    }

    /// Persist via rename-over-temp so readers never observe a torn file
    pub fn save(&self) -> Result<(), EngineError> {
        let save = || -> Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).context("Failed to create cache directory")?;
            }
            let content =
                serde_json::to_string_pretty(self).context("Failed to serialize hash cache")?;
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, content).context("Failed to write temp cache file")?;
            fs::rename(&tmp, &self.path).context("Failed to rename cache file into place")?;
            Ok(())
        };
        save().map_err(|e| {
            CacheError::SaveFailed {
                path: self.path.display().to_string(),
                reason: format!("{:#}", e),
            }
            .into()
        })
    }

    /// Whether the stored hash for this path equals `hash`
    pub fn seen(&self, relative_path: &str, hash: &str) -> bool {
        self.files
            .get(relative_path)
            .is_some_and(|record| record.content_hash == hash)
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileRecord> {
        self.files.get(relative_path)
    }

    pub fn put(&mut self, relative_path: impl Into<String>, record: FileRecord) {
        self.files.insert(relative_path.into(), record);
    }

    pub fn drop_path(&mut self, relative_path: &str) -> Option<FileRecord> {
        self.files.remove(relative_path)
    }

    /// All cached paths; used for orphan detection during reconciliation
    pub fn snapshot(&self) -> HashSet<String> {
        self.files.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Hash raw content the way every component agrees on (hex Sha256)
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Read a file and produce its record fields in one pass
pub fn hash_file(path: &Path) -> Result<(String, u64, i64)> {
    let content = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let metadata =
        fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((hash_bytes(&content), metadata.len(), mtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(hash: &str) -> FileRecord {
        FileRecord {
            content_hash: hash.to_string(),
            size: 10,
            mtime: 1700000000,
            language: Some("python".to_string()),
            last_indexed_at: 1700000001,
        }
    }

    #[test]
    fn test_load_missing_starts_empty() {
        let tmp = tempdir().unwrap();
        let cache = HashCache::load(&tmp.path().join("hash_cache.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_seen_drop() {
        let tmp = tempdir().unwrap();
        let mut cache = HashCache::load(&tmp.path().join("hash_cache.json")).unwrap();

        cache.put("a.py", record("abc"));
        assert!(cache.seen("a.py", "abc"));
        assert!(!cache.seen("a.py", "def"));
        assert!(!cache.seen("b.py", "abc"));

        cache.drop_path("a.py");
        assert!(!cache.seen("a.py", "abc"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("hash_cache.json");

        let mut cache = HashCache::load(&path).unwrap();
        cache.put("src/a.py", record("h1"));
        cache.put("src/b.py", record("h2"));
        cache.save().unwrap();

        let loaded = HashCache::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.seen("src/a.py", "h1"));
        assert_eq!(
            loaded.get("src/b.py").unwrap().language.as_deref(),
            Some("python")
        );
    }

    #[test]
    fn test_corrupted_cache_is_fatal() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("hash_cache.json");
        fs::write(&path, "{ not json").unwrap();

        let err = HashCache::load(&path).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("hash_cache.json");

        let mut cache = HashCache::load(&path).unwrap();
        cache.put("a.py", record("h"));
        cache.save().unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_snapshot() {
        let tmp = tempdir().unwrap();
        let mut cache = HashCache::load(&tmp.path().join("c.json")).unwrap();
        cache.put("a.py", record("1"));
        cache.put("b.py", record("2"));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains("a.py"));
        assert!(snapshot.contains("b.py"));
    }

    #[test]
    fn test_hash_bytes_stable() {
        let a = hash_bytes(b"def f(): return 1");
        let b = hash_bytes(b"def f(): return 1");
        let c = hash_bytes(b"def f(): return 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        fs::write(&path, "hello").unwrap();

        let (hash, size, mtime) = hash_file(&path).unwrap();
        assert_eq!(hash, hash_bytes(b"hello"));
        assert_eq!(size, 5);
        assert!(mtime > 0);
    }
}
