//! Per-project filesystem watcher
//!
//! One watcher thread per project: notify events land in a debounce
//! buffer (coalesced per path, last writer wins), pass the ignore rules,
//! get hashed against the hash cache, and only real content changes
//! become IndexTasks. The task channel is bounded, so a storm of events
//! (branch switch, mass format) blocks the watcher instead of growing
//! memory. A polling rescan covers platforms where native events are
//! unreliable, and the startup reconciliation scan runs before event
//! mode.

use crate::config::IndexerConfig;
use crate::error::{EngineError, WatchError};
use crate::hash_cache::{HashCache, hash_file};
use crate::ignore_rules::{IgnoreRules, symlink_escapes_root};
use crate::project::Project;
use crate::types::IndexTask;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// What a debounced event resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Upsert,
    Delete,
}

/// Everything the watcher thread needs
pub struct WatchContext {
    pub project: Arc<Project>,
    pub indexer: IndexerConfig,
    pub cache: Arc<RwLock<HashCache>>,
    pub rules: Arc<RwLock<Arc<IgnoreRules>>>,
    pub sender: Sender<IndexTask>,
    pub cancel: CancellationToken,
}

/// Handle for one project's watcher thread
pub struct ProjectWatcher {
    cancel: CancellationToken,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ProjectWatcher {
    /// Start watching; the thread exits when the context token cancels
    pub fn spawn(ctx: WatchContext) -> Result<Self, EngineError> {
        let cancel = ctx.cancel.clone();
        let project_name = ctx.project.name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("watch-{}", project_name))
            .spawn(move || {
                if let Err(e) = watch_loop(ctx) {
                    tracing::error!("Watcher for '{}' stopped: {:#}", project_name, e);
                }
            })
            .map_err(|e| WatchError::StartFailed(e.to_string()))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn watch_loop(ctx: WatchContext) -> anyhow::Result<()> {
    let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher: RecommendedWatcher =
        Watcher::new(raw_tx, notify::Config::default()).map_err(|e| {
            EngineError::from(WatchError::StartFailed(e.to_string()))
        })?;
    watcher
        .watch(&ctx.project.root_path, RecursiveMode::Recursive)
        .map_err(|e| EngineError::from(WatchError::StartFailed(e.to_string())))?;

    tracing::info!(
        "Watching project '{}' at {}",
        ctx.project.name,
        ctx.project.root_path.display()
    );

    let debounce = Duration::from_millis(ctx.indexer.debounce_ms);
    let poll_every = Duration::from_secs_f64(ctx.indexer.polling_interval.max(1.0));
    let mut pending: HashMap<PathBuf, (PendingAction, Instant)> = HashMap::new();
    let mut last_poll = Instant::now();

    while !ctx.cancel.is_cancelled() {
        match raw_rx.recv_timeout(debounce) {
            Ok(Ok(event)) => buffer_event(&ctx, &event, &mut pending),
            Ok(Err(e)) => tracing::warn!("Watch error on '{}': {}", ctx.project.name, e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // flush entries whose quiet period elapsed
        let now = Instant::now();
        let ready: Vec<(PathBuf, PendingAction)> = pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= debounce)
            .map(|(path, (action, _))| (path.clone(), *action))
            .collect();
        for (path, action) in ready {
            pending.remove(&path);
            dispatch(&ctx, &path, action);
        }

        if last_poll.elapsed() >= poll_every {
            last_poll = Instant::now();
            polling_rescan(&ctx);
        }
    }

    Ok(())
}

/// Classify a raw notify event into per-path pending actions
fn buffer_event(
    ctx: &WatchContext,
    event: &notify::Event,
    pending: &mut HashMap<PathBuf, (PendingAction, Instant)>,
) {
    let now = Instant::now();
    match &event.kind {
        EventKind::Remove(_) => {
            for path in &event.paths {
                pending.insert(path.clone(), (PendingAction::Delete, now));
            }
        }
        // a rename carries [from, to]; decompose into delete + upsert
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            pending.insert(event.paths[0].clone(), (PendingAction::Delete, now));
            pending.insert(event.paths[1].clone(), (PendingAction::Upsert, now));
        }
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in &event.paths {
                let action = if path.exists() {
                    PendingAction::Upsert
                } else {
                    PendingAction::Delete
                };
                pending.insert(path.clone(), (action, now));
            }
        }
        _ => {}
    }

    // the project ignore file is inside the (ignored) data dir, so catch
    // it before filtering and rebuild the snapshot
    if event
        .paths
        .iter()
        .any(|p| *p == ctx.project.ignore_file_path())
    {
        rebuild_rules(ctx);
    }
}

fn rebuild_rules(ctx: &WatchContext) {
    match IgnoreRules::build(
        &ctx.project.root_path,
        &ctx.indexer,
        &ctx.project.ignore_file_path(),
    ) {
        Ok(rules) => {
            *ctx.rules.write().expect("ignore rules lock poisoned") = Arc::new(rules);
            tracing::info!("Reloaded ignore rules for '{}'", ctx.project.name);
        }
        Err(e) => tracing::warn!("Failed to rebuild ignore rules: {:#}", e),
    }
}

/// Turn one settled path into a task, if it changes anything
fn dispatch(ctx: &WatchContext, path: &Path, action: PendingAction) {
    let Some(relative) = ctx.project.relative_path(path) else {
        return;
    };
    if relative.is_empty() || relative.starts_with(crate::project::DATA_DIR_NAME) {
        return;
    }

    let rules = ctx.rules.read().expect("ignore rules lock poisoned").clone();
    let is_dir = path.is_dir();
    if rules.is_ignored(&relative, is_dir) {
        return;
    }
    if is_dir {
        return;
    }

    match action {
        PendingAction::Delete => {
            let known = ctx
                .cache
                .read()
                .expect("hash cache lock poisoned")
                .get(&relative)
                .is_some();
            if known {
                send_task(ctx, IndexTask::delete(&ctx.project.name, &relative));
            }
        }
        PendingAction::Upsert => {
            if symlink_escapes_root(path, &ctx.project.root_path) {
                return;
            }
            match hash_file(path) {
                Ok((hash, size, _mtime)) => {
                    if size as usize > ctx.indexer.max_file_size {
                        tracing::debug!("Skipping oversized file {}", relative);
                        return;
                    }
                    let seen = ctx
                        .cache
                        .read()
                        .expect("hash cache lock poisoned")
                        .seen(&relative, &hash);
                    if !seen {
                        send_task(
                            ctx,
                            IndexTask::upsert(&ctx.project.name, &relative, Some(hash)),
                        );
                    }
                }
                // file vanished between event and hash; the delete event follows
                Err(e) => tracing::debug!("Could not hash {}: {:#}", relative, e),
            }
        }
    }
}

/// Blocking send: backpressure throttles the watcher when the pipeline
/// falls behind
fn send_task(ctx: &WatchContext, task: IndexTask) {
    tracing::debug!(
        "Enqueue {:?} {} for '{}'",
        task.kind,
        task.relative_path,
        task.project
    );
    if ctx.sender.blocking_send(task).is_err() {
        tracing::debug!("Task channel closed for '{}'", ctx.project.name);
    }
}

/// Fallback scan for missed native events: disk vs cache, both directions
fn polling_rescan(ctx: &WatchContext) {
    let rules = ctx.rules.read().expect("ignore rules lock poisoned").clone();
    let mut on_disk = Vec::new();
    collect_files(&ctx.project.root_path, &ctx.project.root_path, &rules, &mut on_disk);

    let cached = ctx
        .cache
        .read()
        .expect("hash cache lock poisoned")
        .snapshot();

    for path in &on_disk {
        dispatch(ctx, path, PendingAction::Upsert);
    }
    for relative in cached {
        if !ctx.project.absolute_path(&relative).exists() {
            send_task(ctx, IndexTask::delete(&ctx.project.name, &relative));
        }
    }
}

/// Recursive walk in sorted directory order, honoring ignore rules
pub(crate) fn collect_files(
    dir: &Path,
    root: &Path,
    rules: &IgnoreRules,
    out: &mut Vec<PathBuf>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    entries.sort();

    for path in entries {
        let Some(relative) = path
            .strip_prefix(root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
        else {
            continue;
        };
        let is_dir = path.is_dir();
        if rules.is_ignored(&relative, is_dir) {
            continue;
        }
        if is_dir {
            collect_files(&path, root, rules, out);
        } else if !symlink_escapes_root(&path, root) {
            out.push(path);
        }
    }
}

/// Startup reconciliation: compare filesystem, hash cache and vector
/// store, producing catch-up tasks in directory order
///
/// `store_has_rows` probes whether the vector store still holds chunks
/// for a cached path; a file that committed its cache entry but lost its
/// store rows is re-indexed.
pub fn reconciliation_scan(
    project: &Project,
    indexer: &IndexerConfig,
    rules: &IgnoreRules,
    cache: &HashCache,
    store_has_rows: impl Fn(&str) -> bool,
) -> Vec<IndexTask> {
    let mut tasks = Vec::new();
    let mut on_disk = Vec::new();
    collect_files(&project.root_path, &project.root_path, rules, &mut on_disk);

    let mut seen_paths = std::collections::HashSet::new();
    for path in on_disk {
        let Some(relative) = project.relative_path(&path) else {
            continue;
        };
        seen_paths.insert(relative.clone());

        let Ok((hash, size, _mtime)) = hash_file(&path) else {
            continue;
        };
        if size as usize > indexer.max_file_size {
            continue;
        }
        if !cache.seen(&relative, &hash) {
            tasks.push(IndexTask::upsert(&project.name, &relative, Some(hash)));
        } else if !store_has_rows(&relative) {
            // cache says indexed but the store lost the rows; redo the file
            tasks.push(IndexTask::upsert(&project.name, &relative, Some(hash)));
        }
    }

    for relative in cache.snapshot() {
        if !seen_paths.contains(&relative) {
            tasks.push(IndexTask::delete(&project.name, &relative));
        }
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_cache::{FileRecord, hash_bytes};
    use tempfile::tempdir;

    fn rules_for(project: &Project, indexer: &IndexerConfig) -> IgnoreRules {
        IgnoreRules::build(&project.root_path, indexer, &project.ignore_file_path()).unwrap()
    }

    fn record_for(content: &str) -> FileRecord {
        FileRecord {
            content_hash: hash_bytes(content.as_bytes()),
            size: content.len() as u64,
            mtime: 0,
            language: None,
            last_indexed_at: 0,
        }
    }

    #[test]
    fn test_reconciliation_fresh_project() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("a.py"), "x = 1\n").unwrap();
        std::fs::write(tmp.path().join("b.py"), "y = 2\n").unwrap();

        let project = Project::new("demo", tmp.path());
        let indexer = IndexerConfig::default();
        let rules = rules_for(&project, &indexer);
        let cache = HashCache::load(&project.hash_cache_path()).unwrap();

        let tasks = reconciliation_scan(&project, &indexer, &rules, &cache, |_| true);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.kind == crate::types::TaskKind::Upsert));
        // directory order
        assert_eq!(tasks[0].relative_path, "a.py");
        assert_eq!(tasks[1].relative_path, "b.py");
    }

    #[test]
    fn test_reconciliation_skips_unchanged() {
        let tmp = tempdir().unwrap();
        let content = "x = 1\n";
        std::fs::write(tmp.path().join("a.py"), content).unwrap();

        let project = Project::new("demo", tmp.path());
        let indexer = IndexerConfig::default();
        let rules = rules_for(&project, &indexer);
        let mut cache = HashCache::load(&project.hash_cache_path()).unwrap();
        cache.put("a.py", record_for(content));

        let tasks = reconciliation_scan(&project, &indexer, &rules, &cache, |_| true);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_reconciliation_deletes_orphans() {
        let tmp = tempdir().unwrap();
        let project = Project::new("demo", tmp.path());
        let indexer = IndexerConfig::default();
        let rules = rules_for(&project, &indexer);
        let mut cache = HashCache::load(&project.hash_cache_path()).unwrap();
        cache.put("gone.py", record_for("old"));

        let tasks = reconciliation_scan(&project, &indexer, &rules, &cache, |_| true);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, crate::types::TaskKind::Delete);
        assert_eq!(tasks[0].relative_path, "gone.py");
    }

    #[test]
    fn test_reconciliation_reindexes_missing_store_rows() {
        let tmp = tempdir().unwrap();
        let content = "x = 1\n";
        std::fs::write(tmp.path().join("a.py"), content).unwrap();

        let project = Project::new("demo", tmp.path());
        let indexer = IndexerConfig::default();
        let rules = rules_for(&project, &indexer);
        let mut cache = HashCache::load(&project.hash_cache_path()).unwrap();
        cache.put("a.py", record_for(content));

        // cache is fine but the store lost its rows
        let tasks = reconciliation_scan(&project, &indexer, &rules, &cache, |_| false);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, crate::types::TaskKind::Upsert);
    }

    #[test]
    fn test_reconciliation_honors_ignore_rules() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules")).unwrap();
        std::fs::write(tmp.path().join("node_modules/dep.js"), "x").unwrap();
        std::fs::write(tmp.path().join("keep.js"), "y").unwrap();

        let project = Project::new("demo", tmp.path());
        let indexer = IndexerConfig::default();
        let rules = rules_for(&project, &indexer);
        let cache = HashCache::load(&project.hash_cache_path()).unwrap();

        let tasks = reconciliation_scan(&project, &indexer, &rules, &cache, |_| true);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].relative_path, "keep.js");
    }

    #[test]
    fn test_reconciliation_skips_data_dir() {
        let tmp = tempdir().unwrap();
        let project = Project::new("demo", tmp.path());
        project.ensure_layout().unwrap();
        std::fs::write(project.data_dir.join("scratch.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("src.py"), "x = 1\n").unwrap();

        let indexer = IndexerConfig::default();
        let rules = rules_for(&project, &indexer);
        let cache = HashCache::load(&project.hash_cache_path()).unwrap();

        let tasks = reconciliation_scan(&project, &indexer, &rules, &cache, |_| true);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].relative_path, "src.py");
    }

    #[tokio::test]
    async fn test_watcher_emits_task_on_create() {
        let tmp = tempdir().unwrap();
        let project = Arc::new(Project::new("demo", tmp.path()));
        project.ensure_layout().unwrap();

        let indexer = IndexerConfig {
            debounce_ms: 50,
            ..IndexerConfig::default()
        };
        let rules = Arc::new(RwLock::new(Arc::new(rules_for(&project, &indexer))));
        let cache = Arc::new(RwLock::new(
            HashCache::load(&project.hash_cache_path()).unwrap(),
        ));
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();

        let mut watcher = ProjectWatcher::spawn(WatchContext {
            project: project.clone(),
            indexer,
            cache,
            rules,
            sender: tx,
            cancel: cancel.clone(),
        })
        .unwrap();

        // give the notify backend a moment to arm
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(tmp.path().join("fresh.py"), "def f(): return 1\n").unwrap();

        let task = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no task arrived")
            .expect("channel closed");
        assert_eq!(task.relative_path, "fresh.py");
        assert_eq!(task.kind, crate::types::TaskKind::Upsert);
        assert!(task.asserted_hash.is_some());

        cancel.cancel();
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_watcher_ignores_filtered_paths() {
        let tmp = tempdir().unwrap();
        let project = Arc::new(Project::new("demo", tmp.path()));
        project.ensure_layout().unwrap();
        // project ignore file excludes *.gen.py
        std::fs::write(project.ignore_file_path(), "*.gen.py\n").unwrap();

        let indexer = IndexerConfig {
            debounce_ms: 50,
            ..IndexerConfig::default()
        };
        let rules = Arc::new(RwLock::new(Arc::new(rules_for(&project, &indexer))));
        let cache = Arc::new(RwLock::new(
            HashCache::load(&project.hash_cache_path()).unwrap(),
        ));
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();

        let mut watcher = ProjectWatcher::spawn(WatchContext {
            project: project.clone(),
            indexer,
            cache,
            rules,
            sender: tx,
            cancel: cancel.clone(),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(tmp.path().join("schema.gen.py"), "generated\n").unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(800), rx.recv()).await;
        assert!(outcome.is_err(), "ignored file must not produce a task");

        cancel.cancel();
        watcher.shutdown();
    }
}
