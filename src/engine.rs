//! Engine facade: the programmatic surface collaborators build on
//!
//! Owns the project registry. Each added project gets its own hash
//! cache, vector collection, graph store, bounded task queue, worker
//! pool and watcher; a broken project is registered disabled and never
//! blocks the others. The HTTP layer wraps these operations one-to-one.

use crate::chunker::Chunker;
use crate::config::Config;
use crate::embedder::{EmbeddingClient, HttpEmbedder};
use crate::error::{EngineError, ValidationError};
use crate::graph_store::{Direction, GraphStore, NeighborHit};
use crate::hash_cache::HashCache;
use crate::ignore_rules::IgnoreRules;
use crate::parser_pool::ParserPool;
use crate::pipeline::{Pipeline, PipelineContext};
use crate::project::{Project, ProjectLock, roots_overlap};
use crate::query::QueryPlanner;
use crate::relations::{GraphEdge, GraphNode, NodeKind, RelationshipExtractor};
use crate::types::{IndexTask, IndexerStatus, QueryOptions, QueryResponse};
use crate::vector_store::VectorStore;
use crate::watcher::{ProjectWatcher, WatchContext, collect_files, reconciliation_scan};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// One registered project, either running or disabled
enum ProjectState {
    Active(Arc<ActiveProject>),
    Disabled { project: Arc<Project>, reason: String },
}

struct ActiveProject {
    project: Arc<Project>,
    _lock: ProjectLock,
    ctx: Arc<PipelineContext>,
    sender: Sender<IndexTask>,
    rules: Arc<RwLock<Arc<IgnoreRules>>>,
    pipeline: tokio::sync::Mutex<Option<Pipeline>>,
    watcher: Mutex<Option<ProjectWatcher>>,
    cancel: CancellationToken,
}

impl ActiveProject {
    fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn indexing_in_progress(&self) -> bool {
        self.queued() > 0
            || self
                .ctx
                .status
                .in_flight
                .load(std::sync::atomic::Ordering::Relaxed)
                > 0
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(mut watcher) = self.watcher.lock().expect("watcher slot poisoned").take() {
            watcher.shutdown();
        }
        if let Some(pipeline) = self.pipeline.lock().await.take() {
            pipeline.shutdown().await;
        }
    }
}

/// The indexing and retrieval engine
pub struct Engine {
    config: Arc<Config>,
    pool: Arc<ParserPool>,
    embedder: Arc<dyn EmbeddingClient>,
    planner: QueryPlanner,
    projects: tokio::sync::RwLock<HashMap<String, Arc<ProjectState>>>,
}

impl Engine {
    /// Build an engine talking to the configured embedding endpoint
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let in_flight = Arc::new(Semaphore::new(config.embedding.max_in_flight));
        let embedder: Arc<dyn EmbeddingClient> =
            Arc::new(HttpEmbedder::new(config.embedding.clone(), in_flight));
        Self::with_embedder(config, embedder)
    }

    /// Build an engine around an injected embedding client
    pub fn with_embedder(
        config: Config,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let planner = QueryPlanner::new(config.query.clone(), embedder.clone());
        Ok(Self {
            config,
            pool: Arc::new(ParserPool::new()),
            embedder,
            planner,
            projects: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Register a project and start indexing it
    ///
    /// The root is canonicalized; roots that contain or are contained by
    /// an existing project's root are rejected. A project whose stores
    /// fail their structural checks is registered disabled and the error
    /// surfaces to the caller.
    pub async fn add_project(&self, name: &str, path: &Path) -> Result<(), EngineError> {
        validate_project_name(name)?;
        let root = path
            .canonicalize()
            .map_err(|_| ValidationError::PathNotFound(path.display().to_string()))?;
        if !root.is_dir() {
            return Err(ValidationError::NotADirectory(root.display().to_string()).into());
        }

        let mut projects = self.projects.write().await;
        if projects.contains_key(name) {
            return Err(ValidationError::DuplicateProject(name.to_string()).into());
        }
        for state in projects.values() {
            let existing = match state.as_ref() {
                ProjectState::Active(active) => &active.project,
                ProjectState::Disabled { project, .. } => project,
            };
            if roots_overlap(&root, &existing.root_path) {
                return Err(ValidationError::OverlappingRoots {
                    candidate: root.display().to_string(),
                    existing: existing.root_path.display().to_string(),
                }
                .into());
            }
        }

        let project = Arc::new(Project::new(name, &root));
        match self.open_project(project.clone()) {
            Ok(state) => {
                projects.insert(name.to_string(), Arc::new(state));
                tracing::info!("Added project '{}' at {}", name, root.display());
                Ok(())
            }
            Err(e) => {
                projects.insert(
                    name.to_string(),
                    Arc::new(ProjectState::Disabled {
                        project,
                        reason: e.to_string(),
                    }),
                );
                tracing::error!("Project '{}' disabled at add time: {}", name, e);
                Err(e)
            }
        }
    }

    /// Stop watching a project and erase its data directory; sources are
    /// left untouched
    pub async fn remove_project(&self, name: &str) -> Result<(), EngineError> {
        let state = {
            let mut projects = self.projects.write().await;
            projects
                .remove(name)
                .ok_or_else(|| EngineError::UnknownProject(name.to_string()))?
        };
        match state.as_ref() {
            ProjectState::Active(active) => {
                active.shutdown().await;
                active.project.erase_data_dir()?;
            }
            ProjectState::Disabled { project, .. } => {
                project.erase_data_dir()?;
            }
        }
        tracing::info!("Removed project '{}'", name);
        Ok(())
    }

    /// Erase a project's data directory and rebuild it from a fresh scan;
    /// the recovery path for corrupted stores
    pub async fn reinitialize_project(&self, name: &str) -> Result<(), EngineError> {
        let state = {
            let mut projects = self.projects.write().await;
            projects
                .remove(name)
                .ok_or_else(|| EngineError::UnknownProject(name.to_string()))?
        };
        let project = match state.as_ref() {
            ProjectState::Active(active) => {
                active.shutdown().await;
                active.project.clone()
            }
            ProjectState::Disabled { project, .. } => project.clone(),
        };
        project.erase_data_dir()?;

        let fresh = Arc::new(Project::new(name, &project.root_path));
        let state = self.open_project(fresh)?;
        self.projects
            .write()
            .await
            .insert(name.to_string(), Arc::new(state));
        tracing::info!("Reinitialized project '{}'", name);
        Ok(())
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        self.projects
            .read()
            .await
            .values()
            .map(|state| match state.as_ref() {
                ProjectState::Active(active) => (*active.project).clone(),
                ProjectState::Disabled { project, .. } => (**project).clone(),
            })
            .collect()
    }

    /// Enqueue an upsert for every non-ignored file, unconditionally
    pub async fn trigger_reindex(&self, name: &str) -> Result<usize, EngineError> {
        let active = self.active_project(name).await?;
        let rules = active
            .rules
            .read()
            .expect("ignore rules lock poisoned")
            .clone();
        let project = active.project.clone();

        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            collect_files(&project.root_path, &project.root_path, &rules, &mut files);
            files
        })
        .await
        .map_err(|e| EngineError::other(format!("scan task panicked: {}", e)))?;

        let mut enqueued = 0;
        for path in files {
            if let Some(relative) = active.project.relative_path(&path) {
                let task = IndexTask::upsert(name, &relative, None);
                if active.sender.send(task).await.is_ok() {
                    enqueued += 1;
                }
            }
        }
        tracing::info!("Reindex of '{}' enqueued {} files", name, enqueued);
        Ok(enqueued)
    }

    /// Semantic search with graph enrichment
    pub async fn query(
        &self,
        name: &str,
        query_text: &str,
        options: &QueryOptions,
    ) -> Result<QueryResponse, EngineError> {
        let active = self.active_project(name).await?;
        self.planner
            .query(
                &active.ctx.vector,
                &active.ctx.graph,
                query_text,
                options,
                active.indexing_in_progress(),
            )
            .await
    }

    /// 1-hop neighborhood of a graph node
    pub async fn graph_neighbors(
        &self,
        name: &str,
        node_id: &str,
    ) -> Result<Vec<NeighborHit>, EngineError> {
        let active = self.active_project(name).await?;
        if active.ctx.graph.get_node(node_id).is_none() {
            return Err(crate::error::GraphStoreError::NodeNotFound(node_id.to_string()).into());
        }
        Ok(active.ctx.graph.neighbors(node_id, Direction::Both, None))
    }

    pub async fn graph_search_nodes(
        &self,
        name: &str,
        substring: &str,
        kind: Option<NodeKind>,
    ) -> Result<Vec<GraphNode>, EngineError> {
        let active = self.active_project(name).await?;
        Ok(active.ctx.graph.search_nodes(substring, kind))
    }

    pub async fn graph_search_edges(
        &self,
        name: &str,
        substring: &str,
    ) -> Result<Vec<GraphEdge>, EngineError> {
        let active = self.active_project(name).await?;
        Ok(active.ctx.graph.search_edges(substring))
    }

    /// Pipeline status for one project or all of them
    pub async fn indexer_status(
        &self,
        name: Option<&str>,
    ) -> Result<HashMap<String, IndexerStatus>, EngineError> {
        let projects = self.projects.read().await;
        let mut out = HashMap::new();
        for (project_name, state) in projects.iter() {
            if let Some(filter) = name
                && filter != project_name
            {
                continue;
            }
            out.insert(project_name.clone(), status_of(state));
        }
        if let Some(filter) = name
            && out.is_empty()
        {
            return Err(EngineError::UnknownProject(filter.to_string()));
        }
        Ok(out)
    }

    /// Stop all watchers and worker pools
    pub async fn shutdown(&self) {
        let projects = self.projects.read().await;
        for state in projects.values() {
            if let ProjectState::Active(active) = state.as_ref() {
                active.shutdown().await;
            }
        }
    }

    async fn active_project(&self, name: &str) -> Result<Arc<ActiveProject>, EngineError> {
        let projects = self.projects.read().await;
        let state = projects
            .get(name)
            .ok_or_else(|| EngineError::UnknownProject(name.to_string()))?;
        match state.as_ref() {
            ProjectState::Active(active) => Ok(active.clone()),
            ProjectState::Disabled { reason, .. } => {
                tracing::debug!(
                    "Rejecting call against disabled project '{}': {}",
                    name,
                    reason
                );
                Err(EngineError::ProjectDisabled(name.to_string()))
            }
        }
    }

    /// Open stores, spawn the pipeline and watcher, kick off reconciliation
    fn open_project(&self, project: Arc<Project>) -> Result<ProjectState, EngineError> {
        project.ensure_layout()?;
        let lock = ProjectLock::acquire(&project)?;

        let cache = Arc::new(RwLock::new(HashCache::load(&project.hash_cache_path())?));
        let (vector, model_changed) =
            VectorStore::open(&project.vector_dir(), self.embedder.model_id())?;
        let vector = Arc::new(vector);
        let graph = Arc::new(GraphStore::open(&project.graph_path())?);
        if model_changed {
            tracing::info!(
                "Embedding model changed for '{}'; reconciliation will re-index everything",
                project.name
            );
        }

        let rules = Arc::new(RwLock::new(Arc::new(IgnoreRules::build(
            &project.root_path,
            &self.config.indexer,
            &project.ignore_file_path(),
        )?)));

        let chunker = Arc::new(Chunker::new(self.config.chunking, self.pool.clone()));
        let extractor = Arc::new(RelationshipExtractor::new(self.pool.clone()));
        let ctx = Arc::new(PipelineContext::new(
            project.clone(),
            self.config.clone(),
            cache.clone(),
            vector.clone(),
            graph,
            chunker,
            extractor,
            self.embedder.clone(),
        ));

        let (sender, receiver) =
            tokio::sync::mpsc::channel::<IndexTask>(self.config.indexer.queue_capacity);
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::spawn(ctx.clone(), receiver, cancel.clone());

        let watcher = ProjectWatcher::spawn(WatchContext {
            project: project.clone(),
            indexer: self.config.indexer.clone(),
            cache: cache.clone(),
            rules: rules.clone(),
            sender: sender.clone(),
            cancel: cancel.clone(),
        })?;

        // reconciliation backlog drains before live events matter
        {
            let project = project.clone();
            let indexer = self.config.indexer.clone();
            let rules = rules.read().expect("ignore rules lock poisoned").clone();
            let cache = cache.clone();
            let vector = vector.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let tasks = tokio::task::spawn_blocking(move || {
                    let cache = cache.read().expect("hash cache lock poisoned");
                    reconciliation_scan(&project, &indexer, &rules, &cache, |path| {
                        !vector.list_by_path(path).is_empty()
                    })
                })
                .await
                .unwrap_or_default();
                let count = tasks.len();
                for task in tasks {
                    if sender.send(task).await.is_err() {
                        return;
                    }
                }
                if count > 0 {
                    tracing::info!("Reconciliation enqueued {} tasks", count);
                }
            });
        }

        Ok(ProjectState::Active(Arc::new(ActiveProject {
            project,
            _lock: lock,
            ctx,
            sender,
            rules,
            pipeline: tokio::sync::Mutex::new(Some(pipeline)),
            watcher: Mutex::new(Some(watcher)),
            cancel,
        })))
    }
}

fn status_of(state: &ProjectState) -> IndexerStatus {
    use std::sync::atomic::Ordering;
    match state {
        ProjectState::Active(active) => {
            let status = &active.ctx.status;
            let last_commit = status.last_commit_ts.load(Ordering::Relaxed);
            IndexerStatus {
                queued: active.queued(),
                in_flight: status.in_flight.load(Ordering::Relaxed),
                last_commit_ts: (last_commit > 0).then_some(last_commit),
                error_counts: crate::types::ErrorCounts {
                    transient: status.transient_failures.load(Ordering::Relaxed),
                    permanent: status.permanent_failures.load(Ordering::Relaxed),
                },
                files_indexed: active
                    .ctx
                    .cache
                    .read()
                    .expect("hash cache lock poisoned")
                    .len(),
                disabled: false,
            }
        }
        ProjectState::Disabled { .. } => IndexerStatus {
            disabled: true,
            ..IndexerStatus::default()
        },
    }
}

fn validate_project_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidProjectName(name.to_string()).into())
    }
}
