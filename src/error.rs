use thiserror::Error;

/// Core error taxonomy for the transaction runner (spec §7).
#[derive(Error, Debug)]
pub enum ServedError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Domain failure: {0}")]
    DomainFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ServedError>;
