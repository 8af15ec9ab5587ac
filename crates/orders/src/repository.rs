//! Order repository contract and row hydration.

use async_trait::async_trait;
use unit_of_work::{DomainEntity, Entity, EntityId, StorageTransaction, UnitOfWork};

use crate::error::RepositoryError;
use crate::order::{Money, Order, OrderLine};

/// Stored state of one order row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRow {
    pub id: EntityId,
    pub customer: String,
}

/// Stored state of one order line row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLineRow {
    pub id: EntityId,
    pub order_id: EntityId,
    pub product: String,
    pub quantity: u32,
    pub price: Money,
}

impl OrderRow {
    /// Builds the aggregate from the order row and its line rows.
    pub fn hydrate(self, lines: Vec<OrderLineRow>) -> Entity<Order> {
        let lines = lines
            .into_iter()
            .map(|row| {
                Entity::new(OrderLine::restore(
                    row.id,
                    row.order_id,
                    row.product,
                    row.quantity,
                    row.price,
                ))
            })
            .collect();
        Entity::new(Order::restore(self.id, self.customer, lines))
    }
}

/// Loads orders into a unit of work.
///
/// Every order returned by a load is registered as existing with the unit of
/// work before it is handed out, so any mutation the caller makes afterwards
/// is picked up by the next commit. Orders the unit of work already tracks are
/// returned as the tracked handle instead of being reloaded.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Storage transaction the unit of work runs in.
    type Transaction: StorageTransaction;

    /// Loads the orders with the given ids, ordered by id. Unknown ids are skipped.
    async fn by_ids(
        &self,
        uow: &mut UnitOfWork<Self::Transaction>,
        ids: &[EntityId],
    ) -> Result<Vec<Entity<Order>>, RepositoryError>;

    /// Loads one order.
    async fn by_id(
        &self,
        uow: &mut UnitOfWork<Self::Transaction>,
        id: EntityId,
    ) -> Result<Option<Entity<Order>>, RepositoryError> {
        Ok(self.by_ids(uow, &[id]).await?.into_iter().next())
    }

    /// Registers a freshly built order, and its lines, for insertion.
    fn add(&self, uow: &mut UnitOfWork<Self::Transaction>, order: &Entity<Order>) {
        uow.register_new(order);
    }

    /// Registers an order and every line it owns for deletion.
    fn remove(&self, uow: &mut UnitOfWork<Self::Transaction>, order: &Entity<Order>) {
        uow.register_deleted(order);
        for line in order.read().lines() {
            uow.register_deleted(line);
        }
    }
}

/// Splits requested ids into already-tracked handles and ids still to load.
///
/// Ids are deduplicated; the returned ids to load are sorted.
pub(crate) fn split_tracked<T: StorageTransaction>(
    uow: &UnitOfWork<T>,
    ids: &[EntityId],
) -> (Vec<Entity<Order>>, Vec<EntityId>) {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();

    let mut tracked = Vec::new();
    let mut missing = Vec::new();
    for id in ids {
        match uow.find::<Order>(id) {
            Some(order) => tracked.push(order),
            None => missing.push(id),
        }
    }
    (tracked, missing)
}

/// Registers freshly loaded orders and merges them with tracked ones, ordered by id.
pub(crate) fn track<T: StorageTransaction>(
    uow: &mut UnitOfWork<T>,
    tracked: Vec<Entity<Order>>,
    loaded: Vec<Entity<Order>>,
) -> Result<Vec<Entity<Order>>, RepositoryError> {
    for order in &loaded {
        uow.register_existing(order)?;
    }
    metrics::counter!("orders_loaded_total").increment(loaded.len() as u64);
    metrics::counter!("orders_identity_map_hits_total").increment(tracked.len() as u64);
    tracing::debug!(
        loaded = loaded.len(),
        tracked = tracked.len(),
        entity_type = %Order::ENTITY_TYPE,
        "orders registered"
    );

    let mut orders: Vec<_> = tracked.into_iter().chain(loaded).collect();
    orders.sort_by_key(|order| order.id());
    Ok(orders)
}
