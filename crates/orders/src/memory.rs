//! In-memory storage backend.
//!
//! Mirrors the PostgreSQL backend closely enough to run the unit of work end
//! to end in tests: writes are staged until the transaction commits, ids come
//! from per-table sequences that are never rolled back, deleting an order
//! cascades to its lines, and every mapper call is journaled.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use unit_of_work::{
    DataMapper, DomainEntity, Entity, EntityId, EntityType, Operation, StorageTransaction,
    UnitOfWork,
};

use crate::error::{RepositoryError, Result, StorageError};
use crate::order::{Money, Order, OrderLine};
use crate::repository::{OrderLineRow, OrderRepository, OrderRow, split_tracked, track};

/// One recorded mapper invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperCall {
    pub entity_type: EntityType,
    pub operation: Operation,
    /// Entity ids after the call completed.
    pub ids: Vec<Option<EntityId>>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    orders: BTreeMap<EntityId, OrderRow>,
    lines: BTreeMap<EntityId, OrderLineRow>,
}

impl Tables {
    fn lines_of(&self, order_id: EntityId) -> Vec<OrderLineRow> {
        self.lines
            .values()
            .filter(|line| line.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
struct State {
    committed: Tables,
    /// Working copy holding uncommitted writes, if any.
    staged: Option<Tables>,
    next_order_id: i64,
    next_line_id: i64,
    journal: Vec<MapperCall>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            committed: Tables::default(),
            staged: None,
            next_order_id: 1,
            next_line_id: 1,
            journal: Vec::new(),
        }
    }
}

impl State {
    /// Tables as seen from inside the current transaction.
    fn visible(&self) -> &Tables {
        self.staged.as_ref().unwrap_or(&self.committed)
    }

    fn staged(&mut self) -> &mut Tables {
        let committed = &self.committed;
        self.staged.get_or_insert_with(|| committed.clone())
    }

    fn next_order_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_order_id);
        self.next_order_id += 1;
        id
    }

    fn next_line_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_line_id);
        self.next_line_id += 1;
        id
    }

    fn record<E: DomainEntity>(&mut self, operation: Operation, entities: &[Entity<E>]) {
        self.journal.push(MapperCall {
            entity_type: E::ENTITY_TYPE,
            operation,
            ids: entities.iter().map(Entity::id).collect(),
        });
    }
}

/// Shared in-memory database; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<RwLock<State>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts and commits an order with lines `(product, quantity, price)`.
    ///
    /// Returns the order id. Used to seed test and demo data.
    pub async fn insert_order(&self, customer: &str, lines: &[(&str, u32, Money)]) -> EntityId {
        let mut state = self.state.write().await;
        let order_id = state.next_order_id();
        state.committed.orders.insert(
            order_id,
            OrderRow {
                id: order_id,
                customer: customer.to_string(),
            },
        );
        for (product, quantity, price) in lines {
            let id = state.next_line_id();
            state.committed.lines.insert(
                id,
                OrderLineRow {
                    id,
                    order_id,
                    product: product.to_string(),
                    quantity: *quantity,
                    price: *price,
                },
            );
        }
        order_id
    }

    /// Committed state of an order row.
    pub async fn order(&self, id: EntityId) -> Option<OrderRow> {
        self.state.read().await.committed.orders.get(&id).cloned()
    }

    /// Committed line rows of an order, ordered by id.
    pub async fn lines_of(&self, order_id: EntityId) -> Vec<OrderLineRow> {
        self.state.read().await.committed.lines_of(order_id)
    }

    /// Committed state of an order line row.
    pub async fn line(&self, id: EntityId) -> Option<OrderLineRow> {
        self.state.read().await.committed.lines.get(&id).cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.committed.orders.len()
    }

    pub async fn line_count(&self) -> usize {
        self.state.read().await.committed.lines.len()
    }

    /// Returns true if writes are waiting for a commit.
    pub async fn has_staged_writes(&self) -> bool {
        self.state.read().await.staged.is_some()
    }

    /// Every mapper call recorded so far, oldest first.
    pub async fn journal(&self) -> Vec<MapperCall> {
        self.state.read().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.state.write().await.journal.clear();
    }

    /// Publishes staged writes.
    pub async fn commit(&self) {
        let mut state = self.state.write().await;
        if let Some(staged) = state.staged.take() {
            state.committed = staged;
        }
    }

    /// Discards staged writes. Consumed ids are not reused.
    pub async fn rollback(&self) {
        self.state.write().await.staged = None;
    }

    async fn load(&self, ids: &[EntityId]) -> Vec<(OrderRow, Vec<OrderLineRow>)> {
        let state = self.state.read().await;
        let tables = state.visible();
        ids.iter()
            .filter_map(|id| tables.orders.get(id))
            .map(|order| (order.clone(), tables.lines_of(order.id)))
            .collect()
    }
}

fn require_id<E: DomainEntity>(entity: &Entity<E>) -> Result<EntityId> {
    entity.id().ok_or(StorageError::Unidentified {
        entity_type: E::ENTITY_TYPE,
    })
}

/// Data mapper for `Order` rows.
#[derive(Debug, Clone)]
pub struct OrderDataMapper {
    db: InMemoryDatabase,
}

impl OrderDataMapper {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DataMapper for OrderDataMapper {
    type Entity = Order;
    type Error = StorageError;

    async fn save(&self, entities: &[Entity<Order>]) -> Result<()> {
        let mut state = self.db.state.write().await;
        for order in entities {
            let id = match order.id() {
                Some(id) => id,
                None => {
                    let id = state.next_order_id();
                    order.assign_id(id)?;
                    id
                }
            };

            let order = order.read();
            for line in order.lines() {
                line.write().attach_to(id);
            }
            state.staged().orders.insert(
                id,
                OrderRow {
                    id,
                    customer: order.customer.clone(),
                },
            );
        }
        state.record(Operation::Save, entities);
        Ok(())
    }

    async fn update(&self, entities: &[Entity<Order>]) -> Result<()> {
        let mut state = self.db.state.write().await;
        let mut affected = 0;
        for order in entities {
            let id = require_id(order)?;
            if let Some(row) = state.staged().orders.get_mut(&id) {
                row.customer = order.read().customer.clone();
                affected += 1;
            }
        }
        if affected != entities.len() {
            return Err(StorageError::StaleRows {
                entity_type: Order::ENTITY_TYPE,
                expected: entities.len(),
                affected: affected as u64,
            });
        }
        state.record(Operation::Update, entities);
        Ok(())
    }

    async fn delete(&self, entities: &[Entity<Order>]) -> Result<()> {
        let ids = entities.iter().map(require_id).collect::<Result<Vec<_>>>()?;
        let mut state = self.db.state.write().await;
        let tables = state.staged();
        for id in &ids {
            tables.orders.remove(id);
        }
        tables.lines.retain(|_, line| !ids.contains(&line.order_id));
        state.record(Operation::Delete, entities);
        Ok(())
    }
}

/// Mirrors the `quantity > 0` column check.
fn check_quantity(line: &Entity<OrderLine>) -> Result<()> {
    let line = line.read();
    if line.quantity == 0 {
        return Err(StorageError::ZeroQuantity {
            product: line.product.clone(),
        });
    }
    Ok(())
}

/// Data mapper for `OrderLine` rows.
#[derive(Debug, Clone)]
pub struct OrderLineDataMapper {
    db: InMemoryDatabase,
}

impl OrderLineDataMapper {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DataMapper for OrderLineDataMapper {
    type Entity = OrderLine;
    type Error = StorageError;

    async fn save(&self, entities: &[Entity<OrderLine>]) -> Result<()> {
        let mut state = self.db.state.write().await;
        for line in entities {
            check_quantity(line)?;
            let order_id = {
                let line = line.read();
                line.order_id().ok_or_else(|| StorageError::MissingParent {
                    line: line.product.clone(),
                })?
            };
            let id = match line.id() {
                Some(id) => id,
                None => {
                    let id = state.next_line_id();
                    line.assign_id(id)?;
                    id
                }
            };

            let line = line.read();
            state.staged().lines.insert(
                id,
                OrderLineRow {
                    id,
                    order_id,
                    product: line.product.clone(),
                    quantity: line.quantity,
                    price: line.price,
                },
            );
        }
        state.record(Operation::Save, entities);
        Ok(())
    }

    async fn update(&self, entities: &[Entity<OrderLine>]) -> Result<()> {
        let mut state = self.db.state.write().await;
        let mut affected = 0;
        for line in entities {
            let id = require_id(line)?;
            check_quantity(line)?;
            if let Some(row) = state.staged().lines.get_mut(&id) {
                let line = line.read();
                row.product = line.product.clone();
                row.quantity = line.quantity;
                row.price = line.price;
                affected += 1;
            }
        }
        if affected != entities.len() {
            return Err(StorageError::StaleRows {
                entity_type: OrderLine::ENTITY_TYPE,
                expected: entities.len(),
                affected: affected as u64,
            });
        }
        state.record(Operation::Update, entities);
        Ok(())
    }

    async fn delete(&self, entities: &[Entity<OrderLine>]) -> Result<()> {
        let ids = entities.iter().map(require_id).collect::<Result<Vec<_>>>()?;
        let mut state = self.db.state.write().await;
        let tables = state.staged();
        for id in &ids {
            tables.lines.remove(id);
        }
        state.record(Operation::Delete, entities);
        Ok(())
    }
}

/// Storage transaction over an [`InMemoryDatabase`].
#[derive(Debug, Clone)]
pub struct InMemoryTransaction {
    db: InMemoryDatabase,
}

impl InMemoryTransaction {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StorageTransaction for InMemoryTransaction {
    type Error = StorageError;

    async fn commit(&self) -> Result<()> {
        self.db.commit().await;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.db.rollback().await;
        Ok(())
    }
}

/// Order repository reading from an [`InMemoryDatabase`].
#[derive(Debug, Clone)]
pub struct InMemoryOrderRepository {
    db: InMemoryDatabase,
}

impl InMemoryOrderRepository {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    type Transaction = InMemoryTransaction;

    #[tracing::instrument(skip(self, uow), fields(requested = ids.len()))]
    async fn by_ids(
        &self,
        uow: &mut UnitOfWork<InMemoryTransaction>,
        ids: &[EntityId],
    ) -> std::result::Result<Vec<Entity<Order>>, RepositoryError> {
        let (tracked, missing) = split_tracked(uow, ids);
        let loaded = self
            .db
            .load(&missing)
            .await
            .into_iter()
            .map(|(order, lines)| order.hydrate(lines))
            .collect();
        track(uow, tracked, loaded)
    }
}
