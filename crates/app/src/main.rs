//! Driver entry point.

use std::sync::Arc;

use app::workflow::{rename_customers, seed, spread_ids};
use app::{AppError, Backend, Config, LogFormat};
use orders::postgres::run_migrations;
use orders::{
    InMemoryDatabase, InMemoryOrderRepository, InMemoryTransaction, OrderDataMapper,
    OrderLineDataMapper, PgOrderDataMapper, PgOrderLineDataMapper, PgOrderRepository, PgSession,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use unit_of_work::{CommitSummary, MapperRegistry, UnitOfWork};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run_in_memory(config: &Config) -> Result<CommitSummary, AppError> {
    let db = InMemoryDatabase::new();
    let registry = Arc::new(
        MapperRegistry::new()
            .with_mapper(OrderDataMapper::new(db.clone()))
            .with_mapper(OrderLineDataMapper::new(db.clone())),
    );
    let repo = InMemoryOrderRepository::new(db.clone());
    let mut uow = UnitOfWork::new(InMemoryTransaction::new(db.clone()), registry);

    seed(&repo, &mut uow, config.seed_orders).await?;
    let ids = spread_ids(config.seed_orders, config.batch_size);
    rename_customers(&repo, &mut uow, &ids).await
}

async fn run_postgres(config: &Config) -> Result<CommitSummary, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.url())
        .await?;
    run_migrations(&pool).await?;
    tracing::info!(
        host = %config.postgres.host,
        database = %config.postgres.database,
        "connected to postgres"
    );

    let session = PgSession::new(pool.clone());
    let registry = Arc::new(
        MapperRegistry::new()
            .with_mapper(PgOrderDataMapper::new(session.clone()))
            .with_mapper(PgOrderLineDataMapper::new(session.clone())),
    );
    let repo = PgOrderRepository::new(session.clone());
    let mut uow = UnitOfWork::new(session, registry);

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(&pool)
        .await?;
    if existing == 0 {
        seed(&repo, &mut uow, config.seed_orders).await?;
    }

    let max_id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM orders")
        .fetch_one(&pool)
        .await?;
    let ids = spread_ids(usize::try_from(max_id).unwrap_or(0), config.batch_size);
    let summary = rename_customers(&repo, &mut uow, &ids).await?;

    pool.close().await;
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);
    tracing::info!(backend = %config.backend, batch_size = config.batch_size, "starting");

    let summary = match config.backend {
        Backend::Memory => run_in_memory(&config).await,
        Backend::Postgres => run_postgres(&config).await,
    }
    .inspect_err(|error| tracing::error!(%error, "run failed"))?;

    tracing::info!(
        unit_id = %summary.unit_id,
        updated = summary.updated,
        batches = summary.batches,
        committed_at = %summary.committed_at,
        "done"
    );
    Ok(())
}
