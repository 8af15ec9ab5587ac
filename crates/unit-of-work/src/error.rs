use thiserror::Error;

use crate::{EntityId, EntityKey, EntityType, Operation};

/// Boxed error raised by a storage backend.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while snapshotting or diffing tracked entities.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Changes were collected for an entity that was never registered as existing.
    #[error("No snapshot for {key}: entity must be registered before it is diffed")]
    MissingSnapshot { key: EntityKey },

    /// A snapshot was requested for an entity that has no identity yet.
    #[error("Cannot snapshot an unidentified {entity_type}: only loaded entities are tracked")]
    UnidentifiedEntity { entity_type: EntityType },

    /// An already persisted entity was given a different id.
    #[error("Identity of {entity_type} is immutable: {current} cannot become {attempted}")]
    IdentityReassigned {
        entity_type: EntityType,
        current: EntityId,
        attempted: EntityId,
    },
}

/// Errors raised while resolving or invoking data mappers.
#[derive(Debug, Error)]
pub enum MapperError {
    /// No mapper kind is configured for the entity type.
    #[error("The mapper for entity type {entity_type} is not registered")]
    UnregisteredMapper { entity_type: EntityType },

    /// The mapper kind is known but no instance was added.
    #[error("The mapper {mapper} for entity type {entity_type} is not initialized")]
    UninitializedMapper {
        entity_type: EntityType,
        mapper: &'static str,
    },

    /// A batch handed to a mapper contained an entity of another type.
    #[error("Mapper for {expected} received a {found} entity")]
    BatchTypeMismatch {
        expected: EntityType,
        found: EntityType,
    },

    /// The storage backend failed the whole batch.
    #[error("{operation} of {entity_type} batch failed: {source}")]
    Backend {
        entity_type: EntityType,
        operation: Operation,
        #[source]
        source: BackendError,
    },
}

/// Errors surfaced by the unit of work.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// Change tracking failed.
    #[error("Change tracking error: {0}")]
    Tracker(#[from] TrackerError),

    /// Mapper resolution or a persistence call failed.
    #[error("Mapper error: {0}")]
    Mapper(#[from] MapperError),

    /// Finalizing or rolling back the storage transaction failed.
    #[error("Transaction error: {0}")]
    Transaction(#[source] BackendError),
}

/// Result type for unit-of-work operations.
pub type Result<T> = std::result::Result<T, UnitOfWorkError>;
