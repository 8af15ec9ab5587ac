//! Identity primitives shared by the unit-of-work crates.

mod types;

pub use types::{EntityId, EntityKey, EntityType, UnitId};
