//! Mapper registry: resolves an entity type to the mapper that persists it.

use std::any::TypeId;
use std::collections::HashMap;

use crate::{AnyMapper, DataMapper, DomainEntity, EntityType, MapperError};

/// Identity of a concrete mapper type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapperKind {
    type_id: TypeId,
    name: &'static str,
}

impl MapperKind {
    /// Returns the kind of mapper type `M`.
    pub fn of<M: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Lookup table from entity type to data mapper.
///
/// Resolution goes through two maps: a fixed `entity type -> mapper kind`
/// table populated with [`MapperRegistry::bind`], and the mapper instances
/// added with [`MapperRegistry::add_mapper`], keyed by their concrete type.
/// A missing row in the first is a configuration gap, a missing instance in
/// the second a wiring gap; they fail differently.
#[derive(Default)]
pub struct MapperRegistry {
    kinds: HashMap<EntityType, MapperKind>,
    mappers: HashMap<MapperKind, Box<dyn AnyMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `M` is the mapper kind for `M::Entity`.
    pub fn bind<M: DataMapper>(&mut self) -> &mut Self {
        self.kinds
            .insert(M::Entity::ENTITY_TYPE, MapperKind::of::<M>());
        self
    }

    /// Registers a mapper instance, keyed by its concrete type.
    ///
    /// Replaces any instance of the same type.
    pub fn add_mapper<M: DataMapper>(&mut self, mapper: M) -> &mut Self {
        self.mappers.insert(MapperKind::of::<M>(), Box::new(mapper));
        self
    }

    /// Binds and adds a mapper in one step.
    pub fn with_mapper<M: DataMapper>(mut self, mapper: M) -> Self {
        self.bind::<M>();
        self.add_mapper(mapper);
        self
    }

    /// Resolves the mapper for an entity type.
    pub fn get(&self, entity_type: EntityType) -> Result<&dyn AnyMapper, MapperError> {
        let kind = self
            .kinds
            .get(&entity_type)
            .ok_or(MapperError::UnregisteredMapper { entity_type })?;

        self.mappers
            .get(kind)
            .map(|mapper| mapper.as_ref())
            .ok_or(MapperError::UninitializedMapper {
                entity_type,
                mapper: kind.name(),
            })
    }

    /// Returns true if a mapper kind is bound for the entity type.
    pub fn is_registered(&self, entity_type: EntityType) -> bool {
        self.kinds.contains_key(&entity_type)
    }

    /// Number of mapper instances added.
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bindings: Vec<_> = self
            .kinds
            .iter()
            .map(|(ty, kind)| (ty.as_str(), kind.name(), self.mappers.contains_key(kind)))
            .collect();
        bindings.sort();
        f.debug_struct("MapperRegistry")
            .field("bindings", &bindings)
            .finish()
    }
}
