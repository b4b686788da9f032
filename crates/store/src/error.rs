use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid gc duration: {0}")]
    InvalidGcDuration(String),
    #[error("store is shutting down")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;
