//! Order domain and its persistence adapters.
//!
//! This crate provides:
//! - `Order` aggregate owning `OrderLine` entities, with `Money` in cents
//! - Data mappers translating both entity types into storage writes
//! - `OrderRepository` implementations that register loaded orders with the
//!   unit of work
//! - An in-memory backend for tests and a PostgreSQL backend on `sqlx`

pub mod error;
pub mod memory;
pub mod order;
pub mod postgres;
pub mod repository;

pub use error::{RepositoryError, StorageError};
pub use memory::{
    InMemoryDatabase, InMemoryOrderRepository, InMemoryTransaction, MapperCall,
    OrderDataMapper, OrderLineDataMapper,
};
pub use order::{Money, Order, OrderError, OrderLine};
pub use postgres::{PgOrderDataMapper, PgOrderLineDataMapper, PgOrderRepository, PgSession};
pub use repository::{OrderLineRow, OrderRepository, OrderRow};
