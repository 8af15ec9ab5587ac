//! Driver error types.

use orders::{OrderError, RepositoryError, StorageError};
use thiserror::Error;
use unit_of_work::UnitOfWorkError;

/// A configuration value could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Errors surfaced by the driver.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("unit of work error: {0}")]
    UnitOfWork(#[from] UnitOfWorkError),

    #[error("invalid order: {0}")]
    Order(#[from] OrderError),
}
