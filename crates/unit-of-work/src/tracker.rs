//! Snapshot-based change tracking (dirty checking).

use std::collections::{HashMap, HashSet};

use crate::{
    AnyEntity, Attribute, ChangeSet, Classification, EntityKey, Snapshot, SnapshotStore,
    SnapshotValue, TrackerError,
};

/// Tracks registered entities and diffs them against their load-time snapshots.
///
/// Registration state (new entities, deleted entities, snapshots) lives here;
/// the classification itself is recomputed from scratch by
/// [`ChangeTracker::collect_all`], so collecting twice never accumulates.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    new_entities: Classification,
    deleted_entities: Classification,
    snapshots: SnapshotStore,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly created entity for insertion.
    ///
    /// Owned sub-entities that are not tracked yet are registered too, so a new
    /// aggregate is inserted together with its children. Registering the same
    /// handle twice has no effect.
    pub fn register_new(&mut self, entity: AnyEntity) {
        if !self.new_entities.insert(entity.clone()) {
            return;
        }
        for child in owned_entities(&entity.attributes()) {
            if !self.is_tracked(&child) {
                self.register_new(child);
            }
        }
    }

    /// Registers an entity for deletion.
    pub fn register_deleted(&mut self, entity: AnyEntity) {
        self.deleted_entities.insert(entity);
    }

    /// Snapshots a loaded entity and, recursively, every owned sub-entity.
    ///
    /// Replaces any prior snapshot under the same `(type, id)`.
    pub fn take_snapshot(&mut self, entity: &AnyEntity) -> Result<(), TrackerError> {
        let snapshot = Snapshot::take(entity)?;
        tracing::trace!(key = %snapshot.key(), "snapshot taken");
        self.snapshots.insert(snapshot);

        for child in owned_entities(&entity.attributes()) {
            self.take_snapshot(&child)?;
        }
        Ok(())
    }

    /// Diffs one tracked entity against its snapshot, recording results in `changes`.
    pub fn collect_changes(
        &self,
        entity: &AnyEntity,
        changes: &mut ChangeSet,
    ) -> Result<(), TrackerError> {
        let key = entity.key().ok_or(TrackerError::UnidentifiedEntity {
            entity_type: entity.entity_type(),
        })?;
        let snapshot = self
            .snapshots
            .get(&key)
            .ok_or(TrackerError::MissingSnapshot { key })?;

        for (name, current) in entity.attributes() {
            match snapshot.attribute(name) {
                Some(original) => self.compare_values(original, &current, entity, changes)?,
                None => changes.mark_modified(entity),
            }
        }
        Ok(())
    }

    /// Compares one attribute's original and current value.
    ///
    /// Scalars mark `owner` modified when they differ. Owned entities, alone
    /// or in sequences, are matched by identity and never mark the owner:
    /// tracked children are diffed against their own snapshots, untracked
    /// children are new, and snapshotted children no longer present (removed,
    /// replaced or cleared to null) are detached and deleted at the end of
    /// [`ChangeTracker::collect_all`] unless another owner now holds them.
    pub fn compare_values(
        &self,
        original: &SnapshotValue,
        current: &Attribute,
        owner: &AnyEntity,
        changes: &mut ChangeSet,
    ) -> Result<(), TrackerError> {
        let (originals, items) = (frozen_items(original), current_items(current));
        if holds_entities(originals, items) {
            return self.compare_sequence(originals, items, owner, changes);
        }
        if !original.matches(current) {
            changes.mark_modified(owner);
        }
        Ok(())
    }

    /// Rebuilds the full classification of pending changes.
    ///
    /// This is a pure read over snapshots and current state, so it is safe to
    /// call repeatedly, including after a failed commit.
    pub fn collect_all(&self) -> Result<ChangeSet, TrackerError> {
        let mut changes = ChangeSet::new();
        for entity in self.new_entities.entities() {
            changes.new_entities.insert(entity.clone());
        }
        for snapshot in self.snapshots.iter() {
            self.collect_changes(snapshot.entity(), &mut changes)?;
        }
        self.resolve_detached(&mut changes);
        for entity in self.deleted_entities.entities() {
            changes.deleted_entities.insert(entity.clone());
        }
        changes.resolve_conflicts();

        tracing::debug!(
            new = changes.new_entities.len(),
            modified = changes.modified_entities.len(),
            deleted = changes.deleted_entities.len(),
            "changes collected"
        );
        Ok(changes)
    }

    /// Returns true if the entity has a snapshot.
    pub fn is_tracked(&self, entity: &AnyEntity) -> bool {
        entity
            .key()
            .is_some_and(|key| self.snapshots.contains(&key))
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn new_entities(&self) -> &Classification {
        &self.new_entities
    }

    pub fn deleted_entities(&self) -> &Classification {
        &self.deleted_entities
    }

    /// Returns true if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.new_entities.is_empty() && self.deleted_entities.is_empty()
    }

    fn compare_sequence(
        &self,
        originals: &[SnapshotValue],
        items: &[Attribute],
        owner: &AnyEntity,
        changes: &mut ChangeSet,
    ) -> Result<(), TrackerError> {
        let mut present = HashSet::new();

        for (position, item) in items.iter().enumerate() {
            match item {
                Attribute::Entity(child) if self.is_tracked(child) => {
                    if let Some(key) = child.key() {
                        present.insert(key);
                    }
                    self.collect_changes(child, changes)?;
                }
                Attribute::Entity(child) => self.classify_new(child, changes),
                scalar => {
                    let unchanged = originals
                        .get(position)
                        .is_some_and(|original| original.matches(scalar));
                    if !unchanged {
                        changes.mark_modified(owner);
                    }
                }
            }
        }

        for original in originals {
            if let SnapshotValue::Entity(key) = original
                && !present.contains(key)
            {
                changes.detached.push(*key);
            }
        }
        Ok(())
    }

    fn classify_new(&self, entity: &AnyEntity, changes: &mut ChangeSet) {
        if !changes.new_entities.insert(entity.clone()) {
            return;
        }
        for child in owned_entities(&entity.attributes()) {
            if !self.is_tracked(&child) {
                self.classify_new(&child, changes);
            }
        }
    }

    /// Deletes detached children that no owner holds any more.
    ///
    /// A child moved from one owner to another is detached from the first but
    /// still held by the second, so it is kept.
    fn resolve_detached(&self, changes: &mut ChangeSet) {
        let detached = std::mem::take(&mut changes.detached);
        if detached.is_empty() {
            return;
        }

        let owners = self
            .snapshots
            .iter()
            .map(Snapshot::entity)
            .chain(changes.new_entities.entities());
        let mut holders: HashMap<EntityKey, Vec<Option<EntityKey>>> = HashMap::new();
        for owner in owners {
            let owner_key = owner.key();
            for child in owned_entities(&owner.attributes()) {
                if let Some(key) = child.key() {
                    holders.entry(key).or_default().push(owner_key);
                }
            }
        }

        for key in &detached {
            self.orphan(key, None, &holders, changes);
        }
    }

    /// Deletes `key` and its owned subtree unless an owner other than
    /// `parent` still holds it.
    fn orphan(
        &self,
        key: &EntityKey,
        parent: Option<&EntityKey>,
        holders: &HashMap<EntityKey, Vec<Option<EntityKey>>>,
        changes: &mut ChangeSet,
    ) {
        let held_elsewhere = holders
            .get(key)
            .is_some_and(|owners| {
                owners
                    .iter()
                    .any(|owner| parent.is_none() || owner.as_ref() != parent)
            });
        if held_elsewhere {
            return;
        }
        let Some(snapshot) = self.snapshots.get(key) else {
            return;
        };
        if !changes.deleted_entities.insert(snapshot.entity().clone()) {
            return;
        }
        tracing::debug!(%key, loaded_at = %snapshot.taken_at(), "owned entity detached from its owner");
        for (_, value) in snapshot.attributes() {
            for child in owned_keys(value) {
                self.orphan(&child, Some(key), holders, changes);
            }
        }
    }
}

/// Collects owned sub-entities reachable through attributes and nested lists.
fn owned_entities(attributes: &[(&'static str, Attribute)]) -> Vec<AnyEntity> {
    fn walk(attribute: &Attribute, out: &mut Vec<AnyEntity>) {
        match attribute {
            Attribute::Entity(entity) => out.push(entity.clone()),
            Attribute::List(items) => items.iter().for_each(|item| walk(item, out)),
            Attribute::Value(_) => {}
        }
    }

    let mut out = Vec::new();
    for (_, attribute) in attributes {
        walk(attribute, &mut out);
    }
    out
}

fn owned_keys(value: &SnapshotValue) -> Vec<EntityKey> {
    match value {
        SnapshotValue::Entity(key) => vec![*key],
        SnapshotValue::List(items) => items.iter().flat_map(owned_keys).collect(),
        SnapshotValue::Value(_) => Vec::new(),
    }
}

/// Views a frozen value as a sequence: a list as itself, a single entity as
/// one element, a scalar (including null) as empty.
fn frozen_items(value: &SnapshotValue) -> &[SnapshotValue] {
    match value {
        SnapshotValue::List(items) => items,
        SnapshotValue::Entity(_) => std::slice::from_ref(value),
        SnapshotValue::Value(_) => &[],
    }
}

fn current_items(attribute: &Attribute) -> &[Attribute] {
    match attribute {
        Attribute::List(items) => items,
        Attribute::Entity(_) => std::slice::from_ref(attribute),
        Attribute::Value(_) => &[],
    }
}

fn holds_entities(originals: &[SnapshotValue], items: &[Attribute]) -> bool {
    originals
        .iter()
        .any(|value| matches!(value, SnapshotValue::Entity(_)))
        || items
            .iter()
            .any(|item| matches!(item, Attribute::Entity(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::{Part, part};
    use crate::{DomainEntity, Entity, EntityId, EntityType};

    #[derive(Debug)]
    struct Basket {
        id: Option<EntityId>,
        owner: String,
        note: String,
        priority: i64,
        tags: Vec<i64>,
        parts: Vec<Entity<Part>>,
    }

    impl DomainEntity for Basket {
        const ENTITY_TYPE: EntityType = EntityType::new("Basket");

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }

        fn attributes(&self) -> Vec<(&'static str, Attribute)> {
            vec![
                ("owner", Attribute::value(self.owner.as_str())),
                ("note", Attribute::value(self.note.as_str())),
                ("priority", Attribute::value(self.priority)),
                ("tags", Attribute::values(self.tags.iter().copied())),
                ("parts", Attribute::entities(&self.parts)),
            ]
        }
    }

    fn basket(id: i64, parts: Vec<Entity<Part>>) -> Entity<Basket> {
        Entity::new(Basket {
            id: Some(EntityId::new(id)),
            owner: "C2".to_string(),
            note: String::new(),
            priority: 1,
            tags: vec![3, 4],
            parts,
        })
    }

    fn loaded(entity: &Entity<Basket>) -> ChangeTracker {
        let mut tracker = ChangeTracker::new();
        tracker.take_snapshot(&entity.erase()).unwrap();
        tracker
    }

    #[test]
    fn snapshot_covers_owned_children() {
        let b = basket(1, vec![part(10, "a"), part(11, "b")]);
        let tracker = loaded(&b);
        assert_eq!(tracker.snapshots().len(), 3);
    }

    #[test]
    fn unmutated_entity_has_no_changes() {
        let b = basket(1, vec![part(10, "a")]);
        let tracker = loaded(&b);

        let first = tracker.collect_all().unwrap();
        let second = tracker.collect_all().unwrap();
        assert!(first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn scalar_change_marks_owner_once() {
        let b = basket(1, vec![part(10, "a")]);
        let tracker = loaded(&b);
        {
            let mut basket = b.write();
            basket.owner = "C3".to_string();
            basket.note = "rush".to_string();
            basket.priority = 9;
        }

        let changes = tracker.collect_all().unwrap();
        let modified = changes.modified_entities.get(Basket::ENTITY_TYPE).unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(changes.modified_entities.len(), 1);
    }

    #[test]
    fn child_change_marks_only_child() {
        let line = part(10, "a");
        let b = basket(1, vec![line.clone()]);
        let tracker = loaded(&b);
        line.write().label = "changed".to_string();

        let changes = tracker.collect_all().unwrap();
        assert!(changes.modified_entities.get(Basket::ENTITY_TYPE).is_none());
        let parts = changes.modified_entities.get(Part::ENTITY_TYPE).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].id(), Some(EntityId::new(10)));
    }

    #[test]
    fn scalar_sequence_change_marks_owner() {
        let b = basket(1, vec![]);
        let tracker = loaded(&b);
        b.write().tags.push(5);

        let changes = tracker.collect_all().unwrap();
        assert_eq!(changes.modified_entities.len(), 1);
    }

    #[test]
    fn missing_snapshot_fails_loudly() {
        let tracker = ChangeTracker::new();
        let mut changes = ChangeSet::new();
        let err = tracker
            .collect_changes(&basket(1, vec![]).erase(), &mut changes)
            .unwrap_err();
        assert!(matches!(err, TrackerError::MissingSnapshot { .. }));
    }

    #[test]
    fn appended_child_is_classified_new() {
        let b = basket(1, vec![part(10, "a")]);
        let tracker = loaded(&b);
        let added = Entity::new(Part {
            id: None,
            label: "added".to_string(),
        });
        b.write().parts.push(added.clone());

        let changes = tracker.collect_all().unwrap();
        assert!(changes.new_entities.contains(&added.erase()));
        assert!(changes.modified_entities.is_empty());
    }

    #[test]
    fn removed_child_is_classified_deleted() {
        let b = basket(1, vec![part(10, "a"), part(11, "b")]);
        let tracker = loaded(&b);
        b.write().parts.remove(0);

        let changes = tracker.collect_all().unwrap();
        let deleted = changes.deleted_entities.get(Part::ENTITY_TYPE).unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id(), Some(EntityId::new(10)));
    }

    #[test]
    fn register_new_cascades_to_children() {
        let mut tracker = ChangeTracker::new();
        let child = Entity::new(Part {
            id: None,
            label: "fresh".to_string(),
        });
        let b = Entity::new(Basket {
            id: None,
            owner: "C9".to_string(),
            note: String::new(),
            priority: 0,
            tags: vec![],
            parts: vec![child.clone()],
        });
        tracker.register_new(b.erase());
        tracker.register_new(b.erase());

        let changes = tracker.collect_all().unwrap();
        let types: Vec<_> = changes.new_entities.entity_types().collect();
        assert_eq!(types, vec![Basket::ENTITY_TYPE, Part::ENTITY_TYPE]);
        assert_eq!(changes.new_entities.len(), 2);
    }

    struct Holder {
        id: Option<EntityId>,
        part: Option<Entity<Part>>,
        basket: Option<Entity<Basket>>,
    }

    impl DomainEntity for Holder {
        const ENTITY_TYPE: EntityType = EntityType::new("Holder");

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }

        fn attributes(&self) -> Vec<(&'static str, Attribute)> {
            vec![
                ("part", Attribute::optional(self.part.as_ref())),
                ("basket", Attribute::optional(self.basket.as_ref())),
            ]
        }
    }

    fn holder(
        id: i64,
        part: Option<Entity<Part>>,
        basket: Option<Entity<Basket>>,
    ) -> Entity<Holder> {
        Entity::new(Holder {
            id: Some(EntityId::new(id)),
            part,
            basket,
        })
    }

    fn deleted_ids(changes: &ChangeSet, entity_type: EntityType) -> Vec<EntityId> {
        changes
            .deleted_entities
            .get(entity_type)
            .map(|batch| batch.iter().filter_map(AnyEntity::id).collect())
            .unwrap_or_default()
    }

    #[test]
    fn replaced_owned_entity_is_swapped() {
        let h = holder(1, Some(part(10, "old")), None);
        let mut tracker = ChangeTracker::new();
        tracker.take_snapshot(&h.erase()).unwrap();

        let fresh = Entity::new(Part {
            id: None,
            label: "new".to_string(),
        });
        h.write().part = Some(fresh.clone());

        let changes = tracker.collect_all().unwrap();
        assert!(changes.new_entities.contains(&fresh.erase()));
        assert_eq!(deleted_ids(&changes, Part::ENTITY_TYPE), vec![EntityId::new(10)]);
        assert!(changes.modified_entities.is_empty());
    }

    #[test]
    fn cleared_owned_entity_is_deleted() {
        let h = holder(1, Some(part(10, "kept")), None);
        let mut tracker = ChangeTracker::new();
        tracker.take_snapshot(&h.erase()).unwrap();
        assert_eq!(tracker.snapshots().len(), 2);

        h.write().part = None;

        let changes = tracker.collect_all().unwrap();
        assert_eq!(deleted_ids(&changes, Part::ENTITY_TYPE), vec![EntityId::new(10)]);
        assert!(changes.new_entities.is_empty());
        assert!(changes.modified_entities.is_empty());
    }

    #[test]
    fn filling_an_empty_slot_inserts_the_child() {
        let h = holder(1, None, None);
        let mut tracker = ChangeTracker::new();
        tracker.take_snapshot(&h.erase()).unwrap();

        let fresh = Entity::new(Part {
            id: None,
            label: "new".to_string(),
        });
        h.write().part = Some(fresh.clone());

        let changes = tracker.collect_all().unwrap();
        assert!(changes.new_entities.contains(&fresh.erase()));
        assert!(changes.deleted_entities.is_empty());
    }

    #[test]
    fn cleared_owner_takes_its_children_along() {
        let b = basket(2, vec![part(10, "a"), part(11, "b")]);
        let h = holder(1, None, Some(b.clone()));
        let mut tracker = ChangeTracker::new();
        tracker.take_snapshot(&h.erase()).unwrap();

        h.write().basket = None;

        let changes = tracker.collect_all().unwrap();
        assert_eq!(deleted_ids(&changes, Basket::ENTITY_TYPE), vec![EntityId::new(2)]);
        assert_eq!(
            deleted_ids(&changes, Part::ENTITY_TYPE),
            vec![EntityId::new(10), EntityId::new(11)]
        );
    }

    #[test]
    fn child_moved_between_owners_is_updated_not_deleted() {
        let moved = part(10, "a");
        let from = basket(1, vec![moved.clone(), part(11, "b")]);
        let to = basket(2, vec![]);
        let mut tracker = loaded(&from);
        tracker.take_snapshot(&to.erase()).unwrap();

        from.write().parts.remove(0);
        to.write().parts.push(moved.clone());
        moved.write().label = "moved".to_string();

        let changes = tracker.collect_all().unwrap();
        assert!(changes.deleted_entities.is_empty());
        assert!(changes.modified_entities.contains(&moved.erase()));
    }

    #[test]
    fn child_moved_into_new_owner_is_kept() {
        let moved = part(10, "a");
        let from = basket(1, vec![moved.clone()]);
        let mut tracker = loaded(&from);

        from.write().parts.clear();
        let fresh = Entity::new(Basket {
            id: None,
            owner: "C4".to_string(),
            note: String::new(),
            priority: 0,
            tags: vec![],
            parts: vec![moved.clone()],
        });
        tracker.register_new(fresh.erase());

        let changes = tracker.collect_all().unwrap();
        assert!(changes.deleted_entities.is_empty());
        assert_eq!(changes.new_entities.len(), 1);
        assert_eq!(tracker.new_entities().len(), 1);
    }

    #[test]
    fn deleted_entity_is_not_updated() {
        let b = basket(1, vec![]);
        let mut tracker = loaded(&b);
        b.write().owner = "gone".to_string();
        tracker.register_deleted(b.erase());
        tracker.register_deleted(b.erase());

        let changes = tracker.collect_all().unwrap();
        assert!(changes.modified_entities.is_empty());
        assert_eq!(changes.deleted_entities.len(), 1);
    }
}
