//! Unit-of-work core.
//!
//! This crate provides the persistence-coordination building blocks:
//! - `DomainEntity` and shared `Entity` handles with identity-based equality
//! - Snapshot store and change tracker (dirty checking)
//! - `DataMapper` trait and the type-keyed `MapperRegistry`
//! - `UnitOfWork` coordinator that sequences inserts, updates and deletes
//!   inside one storage transaction

pub mod change_set;
pub mod entity;
pub mod error;
pub mod mapper;
pub mod registry;
pub mod snapshot;
pub mod tracker;
pub mod transaction;
pub mod unit_of_work;

pub use change_set::{ChangeSet, Classification};
pub use common::{EntityId, EntityKey, EntityType, UnitId};
pub use entity::{AnyEntity, Attribute, DomainEntity, Entity};
pub use error::{MapperError, Result, TrackerError, UnitOfWorkError};
pub use mapper::{AnyMapper, DataMapper, Operation};
pub use registry::{MapperKind, MapperRegistry};
pub use snapshot::{Snapshot, SnapshotStore, SnapshotValue};
pub use tracker::ChangeTracker;
pub use transaction::StorageTransaction;
pub use unit_of_work::{CommitSummary, UnitOfWork};
