use anyhow::Context;
use clap::{Parser, Subcommand};
use jobq_pg::PgQueue;
use jobq_worker::{default_worker_id, run_worker, HandlerRegistry, WorkerConfig};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "jobq-cli", version, about = "CLI for the jobq background queue")]
struct Cli {
    #[arg(long, default_value = "http://localhost:3001")]
    server_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue {
        /// Handler name, e.g. "ping" or "location.upsert"
        #[arg(long = "type")]
        job_type: String,

        /// Dedupe key within the type, e.g. "ping:test"
        #[arg(long)]
        key: String,

        /// JSON payload string, e.g. '{"msg":"hi"}'
        #[arg(long, default_value = "{}")]
        json: String,

        #[arg(long)]
        max_attempts: Option<i32>,

        /// Delay before the job becomes claimable, in milliseconds
        #[arg(long)]
        run_after_ms: Option<i64>,
    },

    /// Ping server health endpoint
    Ping,

    /// List jobs, optionally filtered by status
    Jobs {
        /// queued | running | retrying | succeeded | dead
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show one job and its recent runs
    Show {
        id: i64,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Run a worker (same as the jobq-worker binary, but convenient)
    Worker {
        #[arg(long)]
        worker_id: Option<String>,

        #[arg(long, default_value_t = 2)]
        concurrency: usize,

        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,

        #[arg(long, default_value_t = 120)]
        lease_seconds: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobq_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let base = cli.server_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Ping => {
            let url = format!("{}/health", base);
            let r = reqwest::get(url).await?;
            let text = r.text().await.unwrap_or_default();
            println!("{}", text);
        }

        Commands::Enqueue {
            job_type,
            key,
            json: payload_json,
            max_attempts,
            run_after_ms,
        } => {
            let payload: Value =
                serde_json::from_str(&payload_json).context("invalid JSON payload")?;

            let body = json!({
                "type": job_type,
                "key": key,
                "payload": payload,
                "max_attempts": max_attempts,
                "run_after_ms": run_after_ms,
            });

            let url = format!("{}/jobs", base);
            let client = reqwest::Client::new();
            let r = client.post(url).json(&body).send().await?;

            if !r.status().is_success() {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                anyhow::bail!("enqueue failed: {} {}", status, body);
            }

            let body: Value = r.json().await?;
            println!("{}", serde_json::to_string_pretty(&body["job"])?);
        }

        Commands::Jobs { status, limit } => {
            let client = reqwest::Client::new();
            let mut req = client.get(format!("{}/jobs", base));
            if let Some(status) = status {
                req = req.query(&[("status", status)]);
            }
            if let Some(limit) = limit {
                req = req.query(&[("limit", limit.to_string())]);
            }
            let r = req.send().await?;

            if !r.status().is_success() {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                anyhow::bail!("list failed: {} {}", status, body);
            }

            let body: Value = r.json().await?;
            println!("{}", serde_json::to_string_pretty(&body["jobs"])?);
        }

        Commands::Show { id, limit } => {
            let client = reqwest::Client::new();

            let r = client.get(format!("{}/jobs/{}", base, id)).send().await?;
            if !r.status().is_success() {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                anyhow::bail!("show failed: {} {}", status, body);
            }
            let job: Value = r.json().await?;
            println!("{}", serde_json::to_string_pretty(&job["job"])?);

            let mut req = client.get(format!("{}/jobs/{}/runs", base, id));
            if let Some(limit) = limit {
                req = req.query(&[("limit", limit.to_string())]);
            }
            let runs: Value = req.send().await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&runs["runs"])?);
        }

        Commands::Worker {
            worker_id,
            concurrency,
            poll_ms,
            lease_seconds,
        } => {
            let database_url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set (postgres://...)")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;

            let cfg = WorkerConfig {
                worker_id: worker_id.unwrap_or_else(default_worker_id),
                concurrency: concurrency.clamp(1, 32),
                poll_ms: poll_ms.clamp(100, 60_000),
                lease_seconds: lease_seconds.clamp(10, 3600),
            };
            run_worker(PgQueue::new(pool), HandlerRegistry::builtin(), cfg).await?;
        }
    }

    Ok(())
}
