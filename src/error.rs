use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Refusing unconditional {0}: add a filter to limit the affected rows")]
    UnsafeMutation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Generation exhausted: {0}")]
    GenerationExhausted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueryError {
    /// Transient failures worth another transport attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            QueryError::Connection(_) | QueryError::Io(_) => true,
            QueryError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
