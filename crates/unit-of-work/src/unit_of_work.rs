//! Unit of work coordinator.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::{
    ChangeSet, ChangeTracker, DomainEntity, Entity, EntityId, EntityKey, MapperRegistry,
    Operation, Result, StorageTransaction, UnitId, UnitOfWorkError,
};

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub unit_id: UnitId,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Number of mapper calls issued.
    pub batches: usize,
    pub committed_at: DateTime<Utc>,
}

impl CommitSummary {
    fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            inserted: 0,
            updated: 0,
            deleted: 0,
            batches: 0,
            committed_at: Utc::now(),
        }
    }

    fn record(&mut self, operation: Operation, count: usize) {
        match operation {
            Operation::Save => self.inserted += count,
            Operation::Update => self.updated += count,
            Operation::Delete => self.deleted += count,
        }
        self.batches += 1;
    }

    /// Total number of entities written.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }
}

/// Groups the changes of one logical transaction and persists them on commit.
///
/// Repositories register loaded entities with
/// [`UnitOfWork::register_existing`] and freshly built ones with
/// [`UnitOfWork::register_new`]; application code mutates entities in place.
/// [`UnitOfWork::commit`] diffs everything, then issues inserts, updates and
/// deletes (in that order, batched per entity type) through the mapper
/// registry, and finally commits the storage transaction.
///
/// One instance serves one caller at a time; run one per request.
pub struct UnitOfWork<T: StorageTransaction> {
    id: UnitId,
    tracker: ChangeTracker,
    transaction: T,
    registry: Arc<MapperRegistry>,
}

impl<T: StorageTransaction> UnitOfWork<T> {
    /// Creates a unit of work over a storage transaction and mapper registry.
    pub fn new(transaction: T, registry: Arc<MapperRegistry>) -> Self {
        Self {
            id: UnitId::new(),
            tracker: ChangeTracker::new(),
            transaction,
            registry,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Registers a freshly created entity (and its untracked children) for insertion.
    pub fn register_new<E: DomainEntity>(&mut self, entity: &Entity<E>) {
        self.tracker.register_new(entity.erase());
    }

    /// Snapshots a just-loaded entity so later mutations are detected.
    ///
    /// Must be called right after hydration, before the entity is handed to
    /// application code.
    pub fn register_existing<E: DomainEntity>(&mut self, entity: &Entity<E>) -> Result<()> {
        self.tracker.take_snapshot(&entity.erase())?;
        Ok(())
    }

    /// Registers an entity for deletion.
    pub fn register_deleted<E: DomainEntity>(&mut self, entity: &Entity<E>) {
        self.tracker.register_deleted(entity.erase());
    }

    /// Returns the tracked handle for `(E, id)`, if one was registered as existing.
    ///
    /// Repositories consult this identity map so that loading the same row
    /// twice in one unit of work yields the same handle.
    pub fn find<E: DomainEntity>(&self, id: EntityId) -> Option<Entity<E>> {
        self.tracker
            .snapshots()
            .get(&EntityKey::new(E::ENTITY_TYPE, id))
            .and_then(|snapshot| snapshot.entity().downcast::<E>())
    }

    /// Computes what a commit would write right now, without writing it.
    pub fn pending_changes(&self) -> Result<ChangeSet> {
        Ok(self.tracker.collect_all()?)
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn transaction(&self) -> &T {
        &self.transaction
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    /// Persists every pending change and commits the storage transaction.
    ///
    /// On success all tracking state is discarded; entities must be
    /// re-registered to be tracked by a later commit. On failure the error is
    /// returned unchanged and tracking state is kept, so the caller can roll
    /// back or retry.
    #[tracing::instrument(skip(self), fields(unit_id = %self.id))]
    pub async fn commit(&mut self) -> Result<CommitSummary> {
        let started = Instant::now();

        match self.flush().await {
            Ok(summary) => {
                self.tracker = ChangeTracker::new();
                metrics::counter!("uow_commits_total").increment(1);
                metrics::histogram!("uow_commit_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    batches = summary.batches,
                    "unit of work committed"
                );
                Ok(summary)
            }
            Err(e) => {
                metrics::counter!("uow_commit_failures_total").increment(1);
                tracing::warn!(error = %e, "commit failed, tracked changes kept");
                Err(e)
            }
        }
    }

    /// Discards all tracking state and rolls back the storage transaction.
    #[tracing::instrument(skip(self), fields(unit_id = %self.id))]
    pub async fn rollback(&mut self) -> Result<()> {
        let discarded = std::mem::take(&mut self.tracker);
        self.transaction
            .rollback()
            .await
            .map_err(|e| UnitOfWorkError::Transaction(Box::new(e)))?;
        tracing::info!(
            tracked = discarded.snapshots().len(),
            new = discarded.new_entities().len(),
            deleted = discarded.deleted_entities().len(),
            "unit of work rolled back"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<CommitSummary> {
        let changes = self.tracker.collect_all()?;

        // Resolve every mapper before the first write.
        for entity_type in changes.entity_types() {
            self.registry.get(entity_type)?;
        }

        let mut summary = CommitSummary::new(self.id);
        let phases = [
            (Operation::Save, &changes.new_entities),
            (Operation::Update, &changes.modified_entities),
            (Operation::Delete, &changes.deleted_entities),
        ];
        for (operation, classification) in phases {
            for (entity_type, batch) in classification.iter() {
                let mapper = self.registry.get(entity_type)?;
                tracing::debug!(%entity_type, %operation, size = batch.len(), "dispatching batch");
                mapper.dispatch(operation, batch).await?;
                metrics::counter!("uow_batches_total", "operation" => operation.as_str())
                    .increment(1);
                summary.record(operation, batch.len());
            }
        }

        self.transaction
            .commit()
            .await
            .map_err(|e| UnitOfWorkError::Transaction(Box::new(e)))?;
        summary.committed_at = Utc::now();
        Ok(summary)
    }
}

impl<T: StorageTransaction + std::fmt::Debug> std::fmt::Debug for UnitOfWork<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("tracker", &self.tracker)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}
