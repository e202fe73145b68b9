use thiserror::Error;

/// Every variant is safe to retry: no write is presumed to have happened.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("database migration error: {0}")]
    Migration(String),
    #[error("database unavailable: {0}")]
    Unavailable(String),
}
