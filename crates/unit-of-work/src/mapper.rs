//! Data mapper contract.

use async_trait::async_trait;

use crate::{AnyEntity, DomainEntity, Entity, EntityType, MapperError};

/// Persistence operation performed by a data mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Save,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter translating one entity type into storage writes.
///
/// Every operation receives a whole batch of entities of the mapper's type so
/// backends can issue batched I/O. An empty batch must be a no-op. A failure
/// anywhere in the batch fails the whole call.
#[async_trait]
pub trait DataMapper: Send + Sync + 'static {
    /// The entity type this mapper persists.
    type Entity: DomainEntity;

    /// Backend error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Inserts new entities; storage-assigned ids are written back to them.
    async fn save(&self, entities: &[Entity<Self::Entity>]) -> Result<(), Self::Error>;

    /// Writes the current state of modified entities, keyed by identity.
    async fn update(&self, entities: &[Entity<Self::Entity>]) -> Result<(), Self::Error>;

    /// Removes entities by identity.
    async fn delete(&self, entities: &[Entity<Self::Entity>]) -> Result<(), Self::Error>;
}

/// Type-erased view of a [`DataMapper`], as stored in the registry.
#[async_trait]
pub trait AnyMapper: Send + Sync {
    /// The entity type this mapper persists.
    fn entity_type(&self) -> EntityType;

    /// Runs one operation over a batch of type-erased entities.
    ///
    /// Fails with `BatchTypeMismatch` before any I/O if the batch contains an
    /// entity of another type.
    async fn dispatch(&self, operation: Operation, batch: &[AnyEntity]) -> Result<(), MapperError>;

    async fn save(&self, batch: &[AnyEntity]) -> Result<(), MapperError> {
        self.dispatch(Operation::Save, batch).await
    }

    async fn update(&self, batch: &[AnyEntity]) -> Result<(), MapperError> {
        self.dispatch(Operation::Update, batch).await
    }

    async fn delete(&self, batch: &[AnyEntity]) -> Result<(), MapperError> {
        self.dispatch(Operation::Delete, batch).await
    }
}

#[async_trait]
impl<M: DataMapper> AnyMapper for M {
    fn entity_type(&self) -> EntityType {
        M::Entity::ENTITY_TYPE
    }

    async fn dispatch(&self, operation: Operation, batch: &[AnyEntity]) -> Result<(), MapperError> {
        if batch.is_empty() {
            return Ok(());
        }

        let typed = batch
            .iter()
            .map(|entity| {
                entity
                    .downcast::<M::Entity>()
                    .ok_or(MapperError::BatchTypeMismatch {
                        expected: M::Entity::ENTITY_TYPE,
                        found: entity.entity_type(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let result = match operation {
            Operation::Save => DataMapper::save(self, &typed).await,
            Operation::Update => DataMapper::update(self, &typed).await,
            Operation::Delete => DataMapper::delete(self, &typed).await,
        };

        result.map_err(|e| MapperError::Backend {
            entity_type: M::Entity::ENTITY_TYPE,
            operation,
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::entity::tests::{Part, Tool, part};
    use crate::EntityId;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Default)]
    struct PartMapper {
        calls: Mutex<Vec<(Operation, Vec<Option<EntityId>>)>>,
        fail: bool,
    }

    impl PartMapper {
        fn record(&self, operation: Operation, entities: &[Entity<Part>]) -> Result<(), DiskFull> {
            if self.fail {
                return Err(DiskFull);
            }
            let ids = entities.iter().map(Entity::id).collect();
            self.calls.lock().unwrap().push((operation, ids));
            Ok(())
        }
    }

    #[async_trait]
    impl DataMapper for PartMapper {
        type Entity = Part;
        type Error = DiskFull;

        async fn save(&self, entities: &[Entity<Part>]) -> Result<(), DiskFull> {
            self.record(Operation::Save, entities)
        }

        async fn update(&self, entities: &[Entity<Part>]) -> Result<(), DiskFull> {
            self.record(Operation::Update, entities)
        }

        async fn delete(&self, entities: &[Entity<Part>]) -> Result<(), DiskFull> {
            self.record(Operation::Delete, entities)
        }
    }

    #[tokio::test]
    async fn dispatch_downcasts_whole_batch() {
        let mapper = PartMapper::default();
        let batch = vec![part(1, "a").erase(), part(2, "b").erase()];

        AnyMapper::delete(&mapper, &batch).await.unwrap();

        let calls = mapper.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Operation::Delete);
        assert_eq!(calls[0].1, vec![Some(EntityId::new(1)), Some(EntityId::new(2))]);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let mapper = PartMapper::default();
        AnyMapper::save(&mapper, &[]).await.unwrap();
        assert!(mapper.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_entity_rejects_batch() {
        let mapper = PartMapper::default();
        let tool = Entity::new(Tool {
            id: Some(EntityId::new(1)),
            label: "t".to_string(),
        });
        let batch = vec![part(1, "a").erase(), tool.erase()];

        let err = AnyMapper::update(&mapper, &batch).await.unwrap_err();
        assert!(matches!(err, MapperError::BatchTypeMismatch { .. }));
        assert!(mapper.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_surfaces_for_whole_batch() {
        let mapper = PartMapper {
            fail: true,
            ..Default::default()
        };
        let err = AnyMapper::save(&mapper, &[part(1, "a").erase()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MapperError::Backend {
                operation: Operation::Save,
                ..
            }
        ));
    }
}
