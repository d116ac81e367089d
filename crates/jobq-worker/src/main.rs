use std::time::Duration;

use jobq_pg::PgQueue;
use jobq_worker::{run_worker, HandlerRegistry, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobq_worker=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set (postgres://...)");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to Postgres");

    let store = PgQueue::new(pool.clone());
    let cfg = WorkerConfig::from_env();

    let result = run_worker(store, HandlerRegistry::builtin(), cfg).await;

    // Short, bounded drain so a wedged connection cannot hang shutdown.
    let _ = tokio::time::timeout(Duration::from_millis(250), pool.close()).await;

    if let Err(error) = result {
        tracing::error!(%error, "worker terminated on fatal error");
        std::process::exit(1);
    }
}
