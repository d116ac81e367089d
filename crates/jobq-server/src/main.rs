use std::sync::Arc;

use jobq_pg::{PgQueue, MIGRATOR};
use jobq_server::{app, app::AppState, config::Config, metrics};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    metrics::init_metrics();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobq_server=info,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .expect("failed to connect to Postgres");

    MIGRATOR.run(&pool).await.expect("failed to run migrations");

    let state = AppState {
        store: Arc::new(PgQueue::new(pool)),
    };

    let app = app::build_app(state).layer(TraceLayer::new_for_http());

    tracing::info!("listening on {}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .expect("failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
