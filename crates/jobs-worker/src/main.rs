use std::sync::Arc;

use anyhow::Context;
use jobs_core::PostgresStore;
use jobs_worker::inference::InferenceConfig;
use jobs_worker::{CircuitBreaker, Worker, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobs_worker=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set (postgres://...)")?;
    let cfg = WorkerConfig::from_env();
    let inference = InferenceConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(cfg.concurrency as u32 + 1)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresStore::new(pool));

    let registry = inference.registry();
    let breaker = Arc::new(CircuitBreaker::new("inference", cfg.breaker.clone()));
    let worker = Arc::new(Worker::new(cfg, store.clone(), store, registry, breaker));

    let shutdown = CancellationToken::new();
    let handles = worker.spawn(shutdown.clone());

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "worker loop panicked");
        }
    }
    Ok(())
}
