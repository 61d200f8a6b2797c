/// Centralized error types for the coderag engine using thiserror
///
/// Errors are grouped by the component that raised them so the pipeline can
/// apply its propagation policy: retry transient failures locally, record
/// permanent per-file failures, and disable a project on store corruption.
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Hash cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("Graph store error: {0}")]
    GraphStore(#[from] GraphStoreError),

    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Project '{0}' is disabled; reinitialize it to recover")]
    ProjectDisabled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while talking to the embedding endpoint
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Transport(String),

    #[error("Embedding request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Embedding endpoint returned server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Embedding endpoint rejected the batch with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Embedding endpoint returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding batch was cancelled")]
    Cancelled,

    #[error("Retry budget of {0} attempts exhausted")]
    RetriesExhausted(usize),
}

/// Errors raised by the per-project vector store
#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Failed to open vector collection: {0}")]
    OpenFailed(String),

    #[error("Vector collection is corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to store vectors: {0}")]
    StoreFailed(String),

    #[error("Failed to search vectors: {0}")]
    SearchFailed(String),

    #[error("Failed to delete vectors: {0}")]
    DeleteFailed(String),

    #[error("Collection was built with model '{stored}' but config requests '{requested}'")]
    ModelMismatch { stored: String, requested: String },
}

/// Errors raised by the per-project graph store
#[derive(Error, Debug)]
pub enum GraphStoreError {
    #[error("Failed to open graph store: {0}")]
    OpenFailed(String),

    #[error("Graph store is corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to persist graph store: {0}")]
    PersistFailed(String),

    #[error("Graph node not found: {0}")]
    NodeNotFound(String),
}

/// Errors raised while chunking a file
#[derive(Error, Debug)]
pub enum ChunkingError {
    #[error("Failed to parse source: {0}")]
    ParseFailed(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Chunk of {size} bytes cannot be split further (max {max})")]
    Unsplittable { size: usize, max: usize },
}

/// Errors raised by the hash cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to load hash cache from '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Failed to save hash cache to '{path}': {reason}")]
    SaveFailed { path: String, reason: String },

    #[error("Hash cache is corrupted: {0}")]
    Corrupted(String),
}

/// Errors raised by the project watcher
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to start filesystem watcher: {0}")]
    StartFailed(String),

    #[error("Watch target vanished: {0}")]
    RootVanished(String),
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Errors related to input validation
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Path does not exist: {0}")]
    PathNotFound(String),

    #[error("Path is not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid project name: {0}")]
    InvalidProjectName(String),

    #[error("Project root '{candidate}' overlaps existing project root '{existing}'")]
    OverlappingRoots { candidate: String, existing: String },

    #[error("Query text is empty")]
    EmptyQuery,

    #[error("Project '{0}' already exists")]
    DuplicateProject(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(format!("{:#}", err))
    }
}

impl EngineError {
    pub fn other(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }

    /// Input errors surface synchronously and never change state
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::UnknownProject(_)
                | EngineError::Config(ConfigError::InvalidValue { .. })
        )
    }

    /// Transient failures are retried with backoff inside the pipeline
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Embedding(EmbeddingError::Transport(_))
                | EngineError::Embedding(EmbeddingError::Timeout(_))
                | EngineError::Embedding(EmbeddingError::ServerError { .. })
                | EngineError::Io(_)
        )
    }

    /// Corruption disables the project until reinitialize_project
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EngineError::VectorStore(VectorStoreError::Corrupted(_))
                | EngineError::GraphStore(GraphStoreError::Corrupted(_))
                | EngineError::Cache(CacheError::Corrupted(_))
        )
    }
}

impl EmbeddingError {
    /// 4xx rejections and count mismatches are permanent for the batch;
    /// transport errors, timeouts and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Transport(_)
                | EmbeddingError::Timeout(_)
                | EmbeddingError::ServerError { .. }
        )
    }
}
