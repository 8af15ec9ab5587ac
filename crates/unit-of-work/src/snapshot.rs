use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{AnyEntity, Attribute, EntityKey, TrackerError};

/// Frozen copy of one attribute value.
///
/// Owned sub-entities are recorded by identity only; their own state lives in
/// their own snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValue {
    Value(serde_json::Value),
    Entity(EntityKey),
    List(Vec<SnapshotValue>),
}

impl SnapshotValue {
    /// Freezes a current attribute value.
    pub fn freeze(attribute: &Attribute) -> Result<Self, TrackerError> {
        Ok(match attribute {
            Attribute::Value(value) => SnapshotValue::Value(value.clone()),
            Attribute::Entity(entity) => {
                SnapshotValue::Entity(entity.key().ok_or(TrackerError::UnidentifiedEntity {
                    entity_type: entity.entity_type(),
                })?)
            }
            Attribute::List(items) => SnapshotValue::List(
                items
                    .iter()
                    .map(SnapshotValue::freeze)
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Returns true if the current attribute is structurally equal to this value.
    pub fn matches(&self, current: &Attribute) -> bool {
        match (self, current) {
            (SnapshotValue::Value(original), Attribute::Value(value)) => original == value,
            (SnapshotValue::Entity(key), Attribute::Entity(entity)) => {
                entity.key().as_ref() == Some(key)
            }
            (SnapshotValue::List(originals), Attribute::List(items)) => {
                originals.len() == items.len()
                    && originals.iter().zip(items).all(|(o, c)| o.matches(c))
            }
            _ => false,
        }
    }
}

/// Immutable copy of an entity's attribute state at registration time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entity: AnyEntity,
    key: EntityKey,
    attributes: Vec<(&'static str, SnapshotValue)>,
    taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Takes a snapshot of the entity's current attribute state.
    ///
    /// Does not recurse; owned sub-entities are snapshotted separately.
    pub fn take(entity: &AnyEntity) -> Result<Self, TrackerError> {
        let key = entity.key().ok_or(TrackerError::UnidentifiedEntity {
            entity_type: entity.entity_type(),
        })?;
        let attributes = entity
            .attributes()
            .iter()
            .map(|(name, value)| SnapshotValue::freeze(value).map(|frozen| (*name, frozen)))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            entity: entity.clone(),
            key,
            attributes,
            taken_at: Utc::now(),
        })
    }

    /// The tracked entity this snapshot was taken from.
    pub fn entity(&self) -> &AnyEntity {
        &self.entity
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// Looks up the frozen value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&SnapshotValue> {
        self.attributes
            .iter()
            .find(|(attr, _)| *attr == name)
            .map(|(_, value)| value)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&'static str, &SnapshotValue)> {
        self.attributes.iter().map(|(name, value)| (*name, value))
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Identity map of snapshots keyed by `(type, id)`, in registration order.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    snapshots: Vec<Snapshot>,
    index: HashMap<EntityKey, usize>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot, replacing any prior snapshot for the same key.
    pub fn insert(&mut self, snapshot: Snapshot) {
        match self.index.get(&snapshot.key) {
            Some(&position) => self.snapshots[position] = snapshot,
            None => {
                self.index.insert(snapshot.key, self.snapshots.len());
                self.snapshots.push(snapshot);
            }
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Snapshot> {
        self.index.get(key).map(|&position| &self.snapshots[position])
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.index.clear();
    }
}
