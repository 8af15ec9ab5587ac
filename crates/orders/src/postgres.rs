//! PostgreSQL storage backend.
//!
//! All mappers and the repository share one [`PgSession`], so every read and
//! write of a unit of work runs inside the same database transaction. Batches
//! are sent as arrays and expanded with `UNNEST`, one statement per call.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use unit_of_work::{DataMapper, DomainEntity, Entity, EntityId, StorageTransaction, UnitOfWork};

use crate::error::{RepositoryError, Result, StorageError};
use crate::order::{Money, Order, OrderLine};
use crate::repository::{OrderLineRow, OrderRepository, OrderRow, split_tracked, track};

/// Runs the database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Shared handle to the transaction of one unit of work.
///
/// The transaction is begun lazily on first use and again after every commit
/// or rollback, like an auto-begin connection. Clones share the transaction.
#[derive(Clone)]
pub struct PgSession {
    pool: PgPool,
    tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl PgSession {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Locks the open transaction, beginning one if none is open.
    pub async fn transaction(
        &self,
    ) -> Result<OwnedMappedMutexGuard<Option<Transaction<'static, Postgres>>, Transaction<'static, Postgres>>>
    {
        let mut slot = Arc::clone(&self.tx).lock_owned().await;
        let tx = match slot.take() {
            Some(tx) => tx,
            None => {
                tracing::debug!("beginning transaction");
                self.pool.begin().await?
            }
        };
        Ok(OwnedMutexGuard::map(slot, |slot| slot.insert(tx)))
    }

    /// Returns true if a transaction is currently open.
    pub async fn in_transaction(&self) -> bool {
        self.tx.lock().await.is_some()
    }
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageTransaction for PgSession {
    type Error = StorageError;

    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take();
        if let Some(tx) = tx {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().await.take();
        if let Some(tx) = tx {
            tx.rollback().await?;
        }
        Ok(())
    }
}

fn require_ids<E: DomainEntity>(entities: &[Entity<E>]) -> Result<Vec<i64>> {
    entities
        .iter()
        .map(|entity| {
            entity
                .id()
                .map(|id| id.as_i64())
                .ok_or(StorageError::Unidentified {
                    entity_type: E::ENTITY_TYPE,
                })
        })
        .collect()
}

/// Reserves `count` ids from a table's serial sequence.
async fn reserve_ids(conn: &mut PgConnection, table: &str, count: usize) -> Result<Vec<i64>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let ids = sqlx::query_scalar(
        "SELECT nextval(pg_get_serial_sequence($1, 'id')) FROM generate_series(1, $2)",
    )
    .bind(table)
    .bind(count as i64)
    .fetch_all(conn)
    .await?;
    Ok(ids)
}

/// Gives every unidentified entity a reserved id; returns all ids in batch order.
async fn assign_ids<E: DomainEntity>(
    conn: &mut PgConnection,
    table: &str,
    entities: &[Entity<E>],
) -> Result<Vec<i64>> {
    let missing = entities.iter().filter(|e| e.id().is_none()).count();
    let mut reserved = reserve_ids(conn, table, missing).await?.into_iter();

    let mut ids = Vec::with_capacity(entities.len());
    for entity in entities {
        let id = match entity.id() {
            Some(id) => id,
            None => {
                let id = reserved.next().map(EntityId::new).ok_or(StorageError::Unidentified {
                    entity_type: E::ENTITY_TYPE,
                })?;
                entity.assign_id(id)?;
                id
            }
        };
        ids.push(id.as_i64());
    }
    Ok(ids)
}

fn ensure_affected<E: DomainEntity>(expected: usize, affected: u64) -> Result<()> {
    if affected != expected as u64 {
        return Err(StorageError::StaleRows {
            entity_type: E::ENTITY_TYPE,
            expected,
            affected,
        });
    }
    Ok(())
}

/// Data mapper for the `orders` table.
#[derive(Debug, Clone)]
pub struct PgOrderDataMapper {
    session: PgSession,
}

impl PgOrderDataMapper {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl DataMapper for PgOrderDataMapper {
    type Entity = Order;
    type Error = StorageError;

    #[tracing::instrument(skip_all, fields(batch = entities.len()))]
    async fn save(&self, entities: &[Entity<Order>]) -> Result<()> {
        let mut tx = self.session.transaction().await?;
        let ids = assign_ids(&mut **tx, "orders", entities).await?;

        let mut customers = Vec::with_capacity(entities.len());
        for (order, id) in entities.iter().zip(&ids) {
            let order = order.read();
            for line in order.lines() {
                line.write().attach_to(EntityId::new(*id));
            }
            customers.push(order.customer.clone());
        }

        sqlx::query(
            r#"
            INSERT INTO orders (id, customer)
            SELECT * FROM UNNEST($1::BIGINT[], $2::TEXT[])
            "#,
        )
        .bind(&ids)
        .bind(&customers)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(batch = entities.len()))]
    async fn update(&self, entities: &[Entity<Order>]) -> Result<()> {
        let ids = require_ids(entities)?;
        let customers: Vec<String> = entities
            .iter()
            .map(|order| order.read().customer.clone())
            .collect();

        let mut tx = self.session.transaction().await?;
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET customer = data.customer
            FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS data(id, customer)
            WHERE orders.id = data.id
            "#,
        )
        .bind(&ids)
        .bind(&customers)
        .execute(&mut **tx)
        .await?;
        ensure_affected::<Order>(ids.len(), result.rows_affected())
    }

    #[tracing::instrument(skip_all, fields(batch = entities.len()))]
    async fn delete(&self, entities: &[Entity<Order>]) -> Result<()> {
        let ids = require_ids(entities)?;
        let mut tx = self.session.transaction().await?;
        // Lines go with their order (ON DELETE CASCADE).
        sqlx::query("DELETE FROM orders WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Data mapper for the `order_lines` table.
#[derive(Debug, Clone)]
pub struct PgOrderLineDataMapper {
    session: PgSession,
}

impl PgOrderLineDataMapper {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

struct LineColumns {
    order_ids: Vec<i64>,
    products: Vec<String>,
    quantities: Vec<i64>,
    prices: Vec<i64>,
}

impl LineColumns {
    fn collect(entities: &[Entity<OrderLine>]) -> Result<Self> {
        let mut columns = LineColumns {
            order_ids: Vec::with_capacity(entities.len()),
            products: Vec::with_capacity(entities.len()),
            quantities: Vec::with_capacity(entities.len()),
            prices: Vec::with_capacity(entities.len()),
        };
        for line in entities {
            let line = line.read();
            let order_id = line.order_id().ok_or_else(|| StorageError::MissingParent {
                line: line.product.clone(),
            })?;
            columns.order_ids.push(order_id.as_i64());
            columns.products.push(line.product.clone());
            columns.quantities.push(i64::from(line.quantity));
            columns.prices.push(line.price.cents());
        }
        Ok(columns)
    }
}

#[async_trait]
impl DataMapper for PgOrderLineDataMapper {
    type Entity = OrderLine;
    type Error = StorageError;

    #[tracing::instrument(skip_all, fields(batch = entities.len()))]
    async fn save(&self, entities: &[Entity<OrderLine>]) -> Result<()> {
        let columns = LineColumns::collect(entities)?;
        let mut tx = self.session.transaction().await?;
        let ids = assign_ids(&mut **tx, "order_lines", entities).await?;

        sqlx::query(
            r#"
            INSERT INTO order_lines (id, order_id, product, quantity, price)
            SELECT id, order_id, product, quantity, price_cents::NUMERIC / 100
            FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[], $4::BIGINT[], $5::BIGINT[])
                AS data(id, order_id, product, quantity, price_cents)
            "#,
        )
        .bind(&ids)
        .bind(&columns.order_ids)
        .bind(&columns.products)
        .bind(&columns.quantities)
        .bind(&columns.prices)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(batch = entities.len()))]
    async fn update(&self, entities: &[Entity<OrderLine>]) -> Result<()> {
        let ids = require_ids(entities)?;
        let columns = LineColumns::collect(entities)?;

        let mut tx = self.session.transaction().await?;
        let result = sqlx::query(
            r#"
            UPDATE order_lines
            SET product = data.product,
                quantity = data.quantity,
                price = data.price_cents::NUMERIC / 100
            FROM UNNEST($1::BIGINT[], $2::TEXT[], $3::BIGINT[], $4::BIGINT[])
                AS data(id, product, quantity, price_cents)
            WHERE order_lines.id = data.id
            "#,
        )
        .bind(&ids)
        .bind(&columns.products)
        .bind(&columns.quantities)
        .bind(&columns.prices)
        .execute(&mut **tx)
        .await?;
        ensure_affected::<OrderLine>(ids.len(), result.rows_affected())
    }

    #[tracing::instrument(skip_all, fields(batch = entities.len()))]
    async fn delete(&self, entities: &[Entity<OrderLine>]) -> Result<()> {
        let ids = require_ids(entities)?;
        let mut tx = self.session.transaction().await?;
        sqlx::query("DELETE FROM order_lines WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Order repository reading through the session's transaction.
#[derive(Debug, Clone)]
pub struct PgOrderRepository {
    session: PgSession,
}

impl PgOrderRepository {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }

    fn row_to_line(row: &PgRow, order_id: EntityId) -> Result<Option<OrderLineRow>> {
        let Some(id) = row.try_get::<Option<i64>, _>("line_id")? else {
            return Ok(None);
        };
        let id = EntityId::new(id);
        let quantity: i32 = row.try_get("quantity")?;
        let quantity = u32::try_from(quantity).map_err(|_| StorageError::InvalidColumn {
            column: "quantity",
            id,
            value: i64::from(quantity),
        })?;

        Ok(Some(OrderLineRow {
            id,
            order_id,
            product: row.try_get("product")?,
            quantity,
            price: Money::from_cents(row.try_get("price_cents")?),
        }))
    }

    /// Groups joined rows (ordered by order id) into aggregates.
    fn build_orders(rows: Vec<PgRow>) -> Result<Vec<Entity<Order>>> {
        let mut orders: Vec<(OrderRow, Vec<OrderLineRow>)> = Vec::new();
        for row in &rows {
            let id = EntityId::new(row.try_get("order_id")?);
            let is_new = orders.last().is_none_or(|(order, _)| order.id != id);
            if is_new {
                orders.push((
                    OrderRow {
                        id,
                        customer: row.try_get("customer")?,
                    },
                    Vec::new(),
                ));
            }
            if let Some(line) = Self::row_to_line(row, id)?
                && let Some((_, lines)) = orders.last_mut()
            {
                lines.push(line);
            }
        }
        Ok(orders
            .into_iter()
            .map(|(order, lines)| order.hydrate(lines))
            .collect())
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    type Transaction = PgSession;

    #[tracing::instrument(skip(self, uow), fields(requested = ids.len()))]
    async fn by_ids(
        &self,
        uow: &mut UnitOfWork<PgSession>,
        ids: &[EntityId],
    ) -> std::result::Result<Vec<Entity<Order>>, RepositoryError> {
        let (tracked, missing) = split_tracked(uow, ids);
        if missing.is_empty() {
            return track(uow, tracked, Vec::new());
        }

        let raw: Vec<i64> = missing.iter().map(|id| id.as_i64()).collect();
        let rows = {
            let mut tx = self.session.transaction().await?;
            sqlx::query(
                r#"
                SELECT o.id AS order_id,
                       o.customer,
                       l.id AS line_id,
                       l.product,
                       l.quantity,
                       (l.price * 100)::BIGINT AS price_cents
                FROM orders o
                LEFT OUTER JOIN order_lines l ON l.order_id = o.id
                WHERE o.id = ANY($1)
                ORDER BY o.id, l.id
                "#,
            )
            .bind(&raw)
            .fetch_all(&mut **tx)
            .await?
        };

        let loaded = Self::build_orders(rows)?;
        track(uow, tracked, loaded)
    }
}
