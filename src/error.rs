//! Error types for every layer of the pipeline.

use thiserror::Error;

/// Failures of the persistent cache or history database.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("store closed")]
    Closed,
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// Failures of a single remote translation call.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("API error: {0}")]
    Api(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("translation timeout")]
    Timeout,

    #[error("translation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("API key not configured")]
    MissingApiKey,
}

/// Failures that abort a whole batch run before any batch is issued.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("translation store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("upstream translation service unavailable: {0}")]
    UpstreamUnavailable(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum GlossaryError {
    #[error("glossary IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("glossary parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures of a whole layer-translation run.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("text source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures while wiring up the application context.
#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] TranslateError),
}
