use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use orders::{
    InMemoryDatabase, InMemoryOrderRepository, InMemoryTransaction, Money, OrderDataMapper,
    OrderLineDataMapper, OrderRepository,
};
use unit_of_work::{EntityId, MapperRegistry, UnitOfWork};

/// Seeds N orders with two lines each; ids run from 1 to N.
async fn seed(n: usize) -> InMemoryDatabase {
    let db = InMemoryDatabase::new();
    for i in 0..n {
        let lines = [
            ("SKU-001", 2, Money::from_cents(1000)),
            ("SKU-002", 1, Money::from_cents(2550)),
        ];
        db.insert_order(&format!("cust_{i}"), &lines).await;
    }
    db
}

fn unit_of_work(db: &InMemoryDatabase) -> UnitOfWork<InMemoryTransaction> {
    let registry = MapperRegistry::new()
        .with_mapper(OrderDataMapper::new(db.clone()))
        .with_mapper(OrderLineDataMapper::new(db.clone()));
    UnitOfWork::new(InMemoryTransaction::new(db.clone()), Arc::new(registry))
}

fn bench_load_and_commit_unchanged(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let db = rt.block_on(seed(100));
    let repo = InMemoryOrderRepository::new(db.clone());
    let ids: Vec<EntityId> = (1..=100).map(EntityId::new).collect();

    c.bench_function("orders/load_and_commit_100_unchanged", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut uow = unit_of_work(&db);
                repo.by_ids(&mut uow, &ids).await.unwrap();
                uow.commit().await.unwrap();
            });
        });
    });
}

fn bench_rename_customers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let db = rt.block_on(seed(100));
    let repo = InMemoryOrderRepository::new(db.clone());
    let ids: Vec<EntityId> = (1..=100).map(EntityId::new).collect();

    c.bench_function("orders/rename_100_customers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut uow = unit_of_work(&db);
                let orders = repo.by_ids(&mut uow, &ids).await.unwrap();
                for order in &orders {
                    order.write().customer.push_str("_upd");
                }
                uow.commit().await.unwrap();
                db.clear_journal().await;
            });
        });
    });
}

criterion_group!(
    benches,
    bench_load_and_commit_unchanged,
    bench_rename_customers,
);
criterion_main!(benches);
