use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cluster API error: {0}")]
    Cluster(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Repository {0} already has an active queue entry")]
    AlreadyQueued(i64),

    #[error("Invalid repository URL: {0}")]
    InvalidRepoUrl(String),

    #[error("Queue entry {0}: {1}")]
    InvalidTransition(i64, String),

    #[error("{0} timed out after {1}s")]
    SubprocessTimeout(&'static str, u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// True when the underlying database error is a unique-constraint
    /// violation (Postgres SQLSTATE 23505).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            VigilError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
