//! Domain entity trait and shared entity handles.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{EntityId, EntityKey, EntityType, TrackerError};

/// Trait for entities persisted through the unit of work.
///
/// An entity is identified by its type tag plus its id. Attribute state is
/// exposed explicitly through [`DomainEntity::attributes`], which is what the
/// change tracker snapshots and diffs: scalars as JSON values, owned
/// sub-entities as handles, sequences as lists.
pub trait DomainEntity: Send + Sync + 'static {
    /// Explicit type tag used for identity and mapper lookup.
    const ENTITY_TYPE: EntityType;

    /// Returns the entity id, or None if storage has not assigned one yet.
    fn id(&self) -> Option<EntityId>;

    /// Stores the id assigned by storage on insert.
    ///
    /// Prefer [`Entity::assign_id`], which rejects reassignment.
    fn assign_id(&mut self, id: EntityId);

    /// Returns the current attribute state, in a stable order.
    fn attributes(&self) -> Vec<(&'static str, Attribute)>;
}

/// One attribute of an entity's current state.
#[derive(Debug, Clone)]
pub enum Attribute {
    /// A scalar value.
    Value(serde_json::Value),
    /// An owned sub-entity.
    Entity(AnyEntity),
    /// A sequence of scalars and/or owned sub-entities.
    List(Vec<Attribute>),
}

impl Attribute {
    /// Creates a scalar attribute.
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Attribute::Value(value.into())
    }

    /// Creates an owned sub-entity attribute.
    pub fn entity<T: DomainEntity>(entity: &Entity<T>) -> Self {
        Attribute::Entity(entity.erase())
    }

    /// Creates an optional owned sub-entity attribute; `None` is a null value.
    pub fn optional<T: DomainEntity>(entity: Option<&Entity<T>>) -> Self {
        match entity {
            Some(entity) => Attribute::entity(entity),
            None => Attribute::Value(serde_json::Value::Null),
        }
    }

    /// Creates a sequence attribute of owned sub-entities.
    pub fn entities<T: DomainEntity>(entities: &[Entity<T>]) -> Self {
        Attribute::List(entities.iter().map(Attribute::entity).collect())
    }

    /// Creates a sequence attribute of scalars.
    pub fn values<V: Into<serde_json::Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Attribute::List(values.into_iter().map(Attribute::value).collect())
    }
}

/// Shared, interior-mutable handle to a domain entity.
///
/// The repository hands these out and the change tracker keeps clones, so
/// application code can mutate the entity in place and the tracker observes
/// the mutation at commit time. Equality and hashing are defined by identity
/// `(type, id)` only; an entity without an id is only equal to itself.
pub struct Entity<T: DomainEntity> {
    inner: Arc<RwLock<T>>,
}

impl<T: DomainEntity> Entity<T> {
    /// Wraps a value in a new handle.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Acquires shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entity id.
    pub fn id(&self) -> Option<EntityId> {
        self.read().id()
    }

    /// Returns the identity-map key, if the entity has an id.
    pub fn key(&self) -> Option<EntityKey> {
        self.id().map(|id| EntityKey::new(T::ENTITY_TYPE, id))
    }

    /// Assigns a storage id.
    ///
    /// Assigning the id the entity already has is a no-op; assigning a
    /// different one fails because persisted identity is immutable.
    pub fn assign_id(&self, id: EntityId) -> Result<(), TrackerError> {
        let mut entity = self.write();
        match entity.id() {
            Some(current) if current != id => Err(TrackerError::IdentityReassigned {
                entity_type: T::ENTITY_TYPE,
                current,
                attempted: id,
            }),
            Some(_) => Ok(()),
            None => {
                entity.assign_id(id);
                Ok(())
            }
        }
    }

    /// Returns true if both handles point at the same entity instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a type-erased handle to the same instance.
    pub fn erase(&self) -> AnyEntity {
        AnyEntity {
            cell: self.inner.clone(),
        }
    }
}

impl<T: DomainEntity> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: DomainEntity> PartialEq for Entity<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.key(), other.key()) {
            (Some(a), Some(b)) => a == b,
            _ => self.ptr_eq(other),
        }
    }
}

impl<T: DomainEntity> Eq for Entity<T> {}

impl<T: DomainEntity> Hash for Entity<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.key() {
            Some(key) => key.hash(state),
            None => Arc::as_ptr(&self.inner).hash(state),
        }
    }
}

impl<T: DomainEntity> std::fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "Entity({}#{})", T::ENTITY_TYPE, id),
            None => write!(f, "Entity({}#new)", T::ENTITY_TYPE),
        }
    }
}

trait ErasedCell: Send + Sync {
    fn entity_type(&self) -> EntityType;
    fn id(&self) -> Option<EntityId>;
    fn attributes(&self) -> Vec<(&'static str, Attribute)>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: DomainEntity> ErasedCell for RwLock<T> {
    fn entity_type(&self) -> EntityType {
        T::ENTITY_TYPE
    }

    fn id(&self) -> Option<EntityId> {
        self.read().unwrap_or_else(PoisonError::into_inner).id()
    }

    fn attributes(&self) -> Vec<(&'static str, Attribute)> {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .attributes()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased entity handle.
///
/// Used wherever entities of different types are tracked together; the
/// concrete handle is recovered with [`AnyEntity::downcast`].
#[derive(Clone)]
pub struct AnyEntity {
    cell: Arc<dyn ErasedCell>,
}

impl AnyEntity {
    /// Returns the entity's type tag.
    pub fn entity_type(&self) -> EntityType {
        self.cell.entity_type()
    }

    /// Returns the entity id.
    pub fn id(&self) -> Option<EntityId> {
        self.cell.id()
    }

    /// Returns the identity-map key, if the entity has an id.
    pub fn key(&self) -> Option<EntityKey> {
        self.id().map(|id| EntityKey::new(self.entity_type(), id))
    }

    /// Returns the entity's current attribute state.
    pub fn attributes(&self) -> Vec<(&'static str, Attribute)> {
        self.cell.attributes()
    }

    /// Returns true if both handles point at the same entity instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.cell), Arc::as_ptr(&other.cell))
    }

    /// Address of the shared instance; stable while any handle is alive.
    pub(crate) fn handle_addr(&self) -> usize {
        Arc::as_ptr(&self.cell).cast::<()>() as usize
    }

    /// Recovers the typed handle, or None if the entity is of another type.
    pub fn downcast<T: DomainEntity>(&self) -> Option<Entity<T>> {
        if self.entity_type() != T::ENTITY_TYPE {
            return None;
        }
        Arc::clone(&self.cell)
            .into_any()
            .downcast::<RwLock<T>>()
            .ok()
            .map(|inner| Entity { inner })
    }
}

impl<T: DomainEntity> From<Entity<T>> for AnyEntity {
    fn from(entity: Entity<T>) -> Self {
        AnyEntity { cell: entity.inner }
    }
}

impl PartialEq for AnyEntity {
    fn eq(&self, other: &Self) -> bool {
        match (self.key(), other.key()) {
            (Some(a), Some(b)) => a == b,
            _ => self.ptr_eq(other),
        }
    }
}

impl Eq for AnyEntity {}

impl Hash for AnyEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.key() {
            Some(key) => key.hash(state),
            None => Arc::as_ptr(&self.cell).cast::<()>().hash(state),
        }
    }
}

impl std::fmt::Debug for AnyEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "AnyEntity({}#{})", self.entity_type(), id),
            None => write!(f, "AnyEntity({}#new)", self.entity_type()),
        }
    }
}
