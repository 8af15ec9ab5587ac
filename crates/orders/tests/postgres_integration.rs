//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p orders --test postgres_integration -- --ignored
//! ```

use std::sync::Arc;

use orders::{
    Money, Order, OrderLine, OrderRepository, PgOrderDataMapper, PgOrderLineDataMapper,
    PgOrderRepository, PgSession, StorageError, postgres::run_migrations,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use unit_of_work::{
    DomainEntity, Entity, EntityId, MapperError, MapperRegistry, UnitOfWork, UnitOfWorkError,
};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            run_migrations(&pool).await.unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

struct Fixture {
    pool: PgPool,
    repo: PgOrderRepository,
    uow: UnitOfWork<PgSession>,
}

/// Fresh pool and session over emptied tables.
async fn fixture() -> Fixture {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE order_lines, orders RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    let session = PgSession::new(pool.clone());
    let registry = MapperRegistry::new()
        .with_mapper(PgOrderDataMapper::new(session.clone()))
        .with_mapper(PgOrderLineDataMapper::new(session.clone()));

    Fixture {
        pool,
        repo: PgOrderRepository::new(session.clone()),
        uow: UnitOfWork::new(session, Arc::new(registry)),
    }
}

/// Inserts an order with lines through a unit of work and returns its id.
async fn insert_order(fx: &mut Fixture, customer: &str, lines: &[(&str, u32, i64)]) -> EntityId {
    let mut order = Order::new(customer).unwrap();
    for (product, quantity, cents) in lines {
        order
            .add_line(*product, *quantity, Money::from_cents(*cents))
            .unwrap();
    }
    let order = Entity::new(order);
    fx.repo.add(&mut fx.uow, &order);
    fx.uow.commit().await.unwrap();
    order.id().unwrap()
}

async fn customer_of(pool: &PgPool, id: EntityId) -> Option<String> {
    sqlx::query_scalar("SELECT customer FROM orders WHERE id = $1")
        .bind(id.as_i64())
        .fetch_optional(pool)
        .await
        .unwrap()
}

async fn line_count(pool: &PgPool, order_id: EntityId) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM order_lines WHERE order_id = $1")
        .bind(order_id.as_i64())
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn insert_assigns_ids_and_round_trips_prices() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[("P1", 10, 1500), ("P2", 1, 99)]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    let order = order.read();
    assert_eq!(order.customer, "C1");
    assert_eq!(order.lines().len(), 2);
    assert_eq!(order.total_amount(), Money::from_cents(15_099));

    let first = order.lines()[0].read();
    assert!(first.id().is_some());
    assert_eq!(first.order_id(), Some(id));
    assert_eq!(first.price, Money::from_cents(1500));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn renamed_customer_is_committed() {
    let mut fx = fixture().await;
    insert_order(&mut fx, "C1", &[("P1", 10, 1500)]).await;
    let id = insert_order(&mut fx, "C2", &[("P2", 5, 2000)]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    order.write().customer = "C3".to_string();
    assert!(fx.uow.transaction().in_transaction().await);
    let summary = fx.uow.commit().await.unwrap();
    assert!(!fx.uow.transaction().in_transaction().await);

    assert_eq!(summary.updated, 1);
    assert_eq!(summary.batches, 1);
    assert_eq!(customer_of(&fx.pool, id).await.as_deref(), Some("C3"));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn batch_updates_and_deletes_lines() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[("P1", 1, 100), ("P2", 2, 200), ("P3", 3, 300)]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    let lines = order.read().lines().to_vec();
    lines[0].write().change_quantity(7).unwrap();
    lines[1].write().price = Money::from_cents(250);
    order.write().remove_line(&lines[2]).unwrap();
    let summary = fx.uow.commit().await.unwrap();

    assert_eq!(summary.updated, 2);
    assert_eq!(summary.deleted, 1);
    assert_eq!(line_count(&fx.pool, id).await, 2);

    let reloaded = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    let reloaded = reloaded.read();
    assert_eq!(reloaded.lines()[0].read().quantity, 7);
    assert_eq!(reloaded.lines()[1].read().price, Money::from_cents(250));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn removing_an_order_cascades_to_lines() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[("P1", 1, 100), ("P2", 1, 100)]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    fx.repo.remove(&mut fx.uow, &order);
    fx.uow.commit().await.unwrap();

    assert!(customer_of(&fx.pool, id).await.is_none());
    assert_eq!(line_count(&fx.pool, id).await, 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn rollback_discards_pending_changes() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[("P1", 1, 100)]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    order.write().customer = "changed".to_string();
    order
        .write()
        .add_line("P9", 1, Money::from_cents(100))
        .unwrap();
    fx.uow.rollback().await.unwrap();

    assert!(!fx.uow.transaction().in_transaction().await);
    assert_eq!(customer_of(&fx.pool, id).await.as_deref(), Some("C1"));
    assert_eq!(line_count(&fx.pool, id).await, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn update_of_deleted_row_fails_the_commit() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    sqlx::query("DELETE FROM orders WHERE id = $1")
        .bind(id.as_i64())
        .execute(&fx.pool)
        .await
        .unwrap();

    order.write().customer = "C9".to_string();
    let err = fx.uow.commit().await.unwrap_err();
    match err {
        UnitOfWorkError::Mapper(MapperError::Backend {
            entity_type,
            source,
            ..
        }) => {
            assert_eq!(entity_type, Order::ENTITY_TYPE);
            assert!(matches!(
                source.downcast_ref::<StorageError>(),
                Some(StorageError::StaleRows { .. })
            ));
        }
        unexpected => panic!("unexpected error: {unexpected}"),
    }
    fx.uow.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn line_added_to_loaded_order_references_it() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    let line = order
        .write()
        .add_line("P1", 4, Money::from_cents(1234))
        .unwrap();
    let summary = fx.uow.commit().await.unwrap();

    assert_eq!(summary.inserted, 1);
    assert!(line.id().is_some());
    assert_eq!(line.read().order_id(), Some(id));
    assert_eq!(line_count(&fx.pool, id).await, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn zero_quantity_violates_the_column_check() {
    let mut fx = fixture().await;
    let id = insert_order(&mut fx, "C1", &[("P1", 3, 100)]).await;

    let order = fx.repo.by_id(&mut fx.uow, id).await.unwrap().unwrap();
    order.read().lines()[0].write().quantity = 0;
    let err = fx.uow.commit().await.unwrap_err();
    match err {
        UnitOfWorkError::Mapper(MapperError::Backend {
            entity_type,
            source,
            ..
        }) => {
            assert_eq!(entity_type, OrderLine::ENTITY_TYPE);
            let Some(StorageError::Database(sqlx::Error::Database(db_err))) =
                source.downcast_ref::<StorageError>()
            else {
                panic!("unexpected source: {source}");
            };
            assert!(db_err.is_check_violation());
        }
        unexpected => panic!("unexpected error: {unexpected}"),
    }
    fx.uow.rollback().await.unwrap();

    let stored: i32 = sqlx::query_scalar("SELECT quantity FROM order_lines WHERE order_id = $1")
        .bind(id.as_i64())
        .fetch_one(&fx.pool)
        .await
        .unwrap();
    assert_eq!(stored, 3);
}
