use std::sync::Arc;

use anyhow::Context;
use jobs_core::PostgresStore;
use jobs_server::app::{self, AppState};
use jobs_server::config::Config;
use jobs_server::metrics;
use jobs_worker::inference::InferenceConfig;
use jobs_worker::{CircuitBreaker, Worker, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metrics::init_metrics();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "jobs_server=info,jobs_worker=info,tower_http=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10 + cfg.embedded_workers as u32)
        .connect(&cfg.database_url)
        .await
        .context("failed to connect to Postgres")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let store = Arc::new(PostgresStore::new(pool));

    let mut worker_cfg = WorkerConfig::from_env();
    worker_cfg.concurrency = cfg.embedded_workers;
    let registry = InferenceConfig::from_env().registry();
    let breaker = Arc::new(CircuitBreaker::new("inference", worker_cfg.breaker.clone()));
    let worker = Arc::new(Worker::new(
        worker_cfg,
        store.clone(),
        store.clone(),
        registry,
        breaker,
    ));

    let shutdown = CancellationToken::new();
    let loops = if cfg.embedded_workers > 0 {
        worker.spawn(shutdown.clone())
    } else {
        Vec::new()
    };

    let state = AppState {
        store: store.clone(),
        outbox: store,
        worker,
    };
    let app = app::build_app(state).layer(TraceLayer::new_for_http());

    tracing::info!(embedded_workers = cfg.embedded_workers, "listening on {}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .context("failed to bind")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server failed")?;

    shutdown.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "worker loop panicked");
        }
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
