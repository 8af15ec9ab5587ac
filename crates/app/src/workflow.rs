//! Seeding and the load-mutate-commit cycle, generic over the backend.

use std::time::Instant;

use orders::{Money, Order, OrderRepository};
use tracing::info;
use unit_of_work::{CommitSummary, Entity, EntityId, UnitOfWork};

use crate::error::AppError;

const PRODUCTS: [&str; 6] = ["ANVIL", "BOLT", "CABLE", "DRILL", "EPOXY", "FLUX"];

/// Inserts `count` orders with one line each through a single unit of work.
///
/// Customers are `cust_0` .. `cust_{count-1}`; quantities and prices vary
/// deterministically with the index.
pub async fn seed<R: OrderRepository>(
    repo: &R,
    uow: &mut UnitOfWork<R::Transaction>,
    count: usize,
) -> Result<CommitSummary, AppError> {
    for i in 0..count {
        let mut order = Order::new(format!("cust_{i}"))?;
        let product = PRODUCTS[i % PRODUCTS.len()];
        let quantity = (i % 10) as u32 + 1;
        let price = Money::from_cents(1000 + (i as i64 * 7919) % 49_000);
        order.add_line(product, quantity, price)?;
        repo.add(uow, &Entity::new(order));
    }

    let summary = uow.commit().await?;
    info!(orders = count, inserted = summary.inserted, "storage seeded");
    Ok(summary)
}

/// Picks `batch_size` ids spread evenly over `1..=total`.
pub fn spread_ids(total: usize, batch_size: usize) -> Vec<EntityId> {
    if total == 0 || batch_size == 0 {
        return Vec::new();
    }
    let step = (total / batch_size).max(1);
    (0..total)
        .step_by(step)
        .take(batch_size)
        .map(|i| EntityId::new(i as i64 + 1))
        .collect()
}

/// Loads the orders, appends `_upd` to every customer, and commits.
#[tracing::instrument(skip_all, fields(requested = ids.len()))]
pub async fn rename_customers<R: OrderRepository>(
    repo: &R,
    uow: &mut UnitOfWork<R::Transaction>,
    ids: &[EntityId],
) -> Result<CommitSummary, AppError> {
    let started = Instant::now();
    let orders = repo.by_ids(uow, ids).await?;
    let loaded_in = started.elapsed();

    for order in &orders {
        order.write().customer.push_str("_upd");
    }

    let summary = uow.commit().await?;
    let total = started.elapsed();
    info!(
        loaded = orders.len(),
        updated = summary.updated,
        batches = summary.batches,
        load_ms = loaded_in.as_secs_f64() * 1000.0,
        total_ms = total.as_secs_f64() * 1000.0,
        "customers renamed"
    );
    Ok(summary)
}
