//! Change classification sets.

use std::collections::HashSet;

use crate::{AnyEntity, EntityKey, EntityType};

/// One type's batch, in insertion order, with an identity index.
///
/// Identified entities are indexed by key; every entity is also indexed by
/// handle, so an entity that gains an id after insertion is still found.
#[derive(Debug, Clone, Default)]
struct Batch {
    entities: Vec<AnyEntity>,
    keys: HashSet<EntityKey>,
    handles: HashSet<usize>,
}

impl Batch {
    fn contains(&self, entity: &AnyEntity) -> bool {
        self.handles.contains(&entity.handle_addr())
            || entity.key().is_some_and(|key| self.keys.contains(&key))
    }

    fn push(&mut self, entity: AnyEntity) {
        self.handles.insert(entity.handle_addr());
        if let Some(key) = entity.key() {
            self.keys.insert(key);
        }
        self.entities.push(entity);
    }

    fn retain(&mut self, mut keep: impl FnMut(&AnyEntity) -> bool) {
        let entities = std::mem::take(&mut self.entities);
        self.keys.clear();
        self.handles.clear();
        for entity in entities {
            if keep(&entity) {
                self.push(entity);
            }
        }
    }
}

/// Entities grouped by type, deduplicated by identity.
///
/// Types are kept in the order they were first seen so that dispatch follows
/// registration order (e.g., parents registered before children are inserted
/// first).
#[derive(Debug, Clone, Default)]
pub struct Classification {
    groups: Vec<(EntityType, Batch)>,
}

impl Classification {
    pub fn new() -> Self {
        Self::default()
    }

    fn batch(&self, entity_type: EntityType) -> Option<&Batch> {
        self.groups
            .iter()
            .find(|(ty, _)| *ty == entity_type)
            .map(|(_, batch)| batch)
    }

    /// Adds an entity unless an equal one is already present.
    ///
    /// Returns true if the entity was added.
    pub fn insert(&mut self, entity: AnyEntity) -> bool {
        let entity_type = entity.entity_type();
        match self.groups.iter_mut().find(|(ty, _)| *ty == entity_type) {
            Some((_, batch)) => {
                if batch.contains(&entity) {
                    return false;
                }
                batch.push(entity);
            }
            None => {
                let mut batch = Batch::default();
                batch.push(entity);
                self.groups.push((entity_type, batch));
            }
        }
        true
    }

    /// Removes an entity; drops the type group if it becomes empty.
    ///
    /// Returns true if the entity was present.
    pub fn remove(&mut self, entity: &AnyEntity) -> bool {
        if !self.contains(entity) {
            return false;
        }
        self.retain(|e| e != entity);
        true
    }

    /// Keeps only the entities for which `keep` returns true, in one pass.
    pub fn retain(&mut self, mut keep: impl FnMut(&AnyEntity) -> bool) {
        for (_, batch) in &mut self.groups {
            batch.retain(&mut keep);
        }
        self.groups.retain(|(_, batch)| !batch.entities.is_empty());
    }

    pub fn contains(&self, entity: &AnyEntity) -> bool {
        self.batch(entity.entity_type())
            .is_some_and(|batch| batch.contains(entity))
    }

    /// Returns the batch for one entity type.
    pub fn get(&self, entity_type: EntityType) -> Option<&[AnyEntity]> {
        self.batch(entity_type).map(|batch| batch.entities.as_slice())
    }

    /// Iterates over `(type, batch)` pairs in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityType, &[AnyEntity])> {
        self.groups
            .iter()
            .map(|(ty, batch)| (*ty, batch.entities.as_slice()))
    }

    /// Iterates over every entity of every type.
    pub fn entities(&self) -> impl Iterator<Item = &AnyEntity> {
        self.groups.iter().flat_map(|(_, batch)| batch.entities.iter())
    }

    pub fn entity_types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.groups.iter().map(|(ty, _)| *ty)
    }

    /// Total number of entities across all types.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, batch)| batch.entities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// The outcome of diffing: what to insert, update and delete.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new_entities: Classification,
    pub modified_entities: Classification,
    pub deleted_entities: Classification,
    /// Tracked children dropped from their owner, pending the check that
    /// no other owner picked them up.
    pub(crate) detached: Vec<EntityKey>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an owner as modified; repeated marks are ignored.
    pub fn mark_modified(&mut self, owner: &AnyEntity) {
        self.modified_entities.insert(owner.clone());
    }

    /// Makes the three sets mutually exclusive.
    ///
    /// A deleted entity is never updated, and an entity that is both new and
    /// deleted never reaches storage.
    pub fn resolve_conflicts(&mut self) {
        let mut cancelled = Classification::new();
        for entity in self.new_entities.entities() {
            if self.deleted_entities.contains(entity) {
                cancelled.insert(entity.clone());
            }
        }

        let deleted = &self.deleted_entities;
        self.modified_entities.retain(|e| !deleted.contains(e));
        self.new_entities.retain(|e| !cancelled.contains(e));
        self.deleted_entities.retain(|e| !cancelled.contains(e));
    }

    /// Entity types touched by any classification, without duplicates.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types = Vec::new();
        for ty in self
            .new_entities
            .entity_types()
            .chain(self.modified_entities.entity_types())
            .chain(self.deleted_entities.entity_types())
        {
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        types
    }

    pub fn len(&self) -> usize {
        self.new_entities.len() + self.modified_entities.len() + self.deleted_entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_entities.is_empty()
            && self.modified_entities.is_empty()
            && self.deleted_entities.is_empty()
    }
}
