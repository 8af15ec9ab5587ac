//! Storage and repository error types.

use thiserror::Error;
use unit_of_work::{EntityId, EntityType, TrackerError, UnitOfWorkError};

/// Errors raised by the order data mappers and storage transactions.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An update or delete was issued for an entity that was never inserted.
    #[error("{entity_type} has no id: it must be inserted before it is written by identity")]
    Unidentified { entity_type: EntityType },

    /// An order line was inserted before its order.
    #[error("Order line {line} has no parent order id; insert the order first")]
    MissingParent { line: String },

    /// An order line would be stored with quantity 0.
    #[error("Order line {product} has quantity 0; stored quantities must be greater than 0")]
    ZeroQuantity { product: String },

    /// Fewer rows than entities were updated: some rows no longer exist.
    #[error("Stale {entity_type} update: {expected} entities, {affected} rows affected")]
    StaleRows {
        entity_type: EntityType,
        expected: usize,
        affected: u64,
    },

    /// A stored column value does not fit the domain type.
    #[error("Invalid value {value} in column {column} of row {id}")]
    InvalidColumn {
        column: &'static str,
        id: EntityId,
        value: i64,
    },

    /// Assigning a storage id to an entity failed.
    #[error("Identity error: {0}")]
    Identity(#[from] TrackerError),
}

/// Errors raised while loading orders into a unit of work.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Reading from storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Registering the loaded entities failed.
    #[error("Unit of work error: {0}")]
    UnitOfWork(#[from] UnitOfWorkError),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Storage(StorageError::Database(e))
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
