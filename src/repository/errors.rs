use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("migration error: {0}")]
    Migration(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
