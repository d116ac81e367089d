pub mod handlers;
mod registry;

pub use registry::{Handler, HandlerRegistry, HandlerResult};

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use jobq_core::{HandlerFailure, JobStore};
use jobq_pg::PgQueue;
use tracing::Instrument;

/// How often each worker sweeps for leases orphaned by crashed workers.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_ms: u64,
    pub lease_seconds: i64,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(default_worker_id);
        let concurrency = env_clamped("WORKER_CONCURRENCY", 2, 1, 32) as usize;
        let poll_ms = env_clamped("POLL_MS", 1000, 100, 60_000) as u64;
        let lease_seconds = env_clamped("LEASE_SECONDS", 120, 10, 3600);

        Self {
            worker_id,
            concurrency,
            poll_ms,
            lease_seconds,
        }
    }
}

fn env_clamped(name: &str, default: i64, min: i64, max: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Worker identity when `WORKER_ID` is not set: `<short-hostname>-<pid>`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let short = host.split('.').next().unwrap_or("unknown");
    format!("{short}-{}", std::process::id())
}

/// Run the dispatch loop until a shutdown signal or a fatal engine error.
///
/// Each batch launches up to `concurrency` parallel claim attempts; an
/// entirely idle batch sleeps `poll_ms` before the next one. A spawned timer
/// reclaims stale leases every 30 s.
pub async fn run_worker(
    store: PgQueue,
    registry: HandlerRegistry,
    cfg: WorkerConfig,
) -> anyhow::Result<()> {
    tracing::info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        poll_ms = cfg.poll_ms,
        lease_seconds = cfg.lease_seconds,
        handlers = ?registry.job_types(),
        "worker started"
    );

    let reclaimer = {
        let store = store.clone();
        let lease_seconds = cfg.lease_seconds;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RECLAIM_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match store.reclaim_stale(lease_seconds).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(reclaimed = n, "reclaimed stale leases"),
                    Err(error) => tracing::warn!(%error, "stale lease reclaim failed"),
                }
            }
        })
    };

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = loop {
        if *shutdown_rx.borrow() {
            tracing::info!("shutdown signal received, draining...");
            break Ok(());
        }

        let batch = (0..cfg.concurrency).map(|_| run_one(&store, &registry, &cfg.worker_id));
        let outcomes = join_all(batch).await;

        let mut processed_any = false;
        let mut fatal = None;
        for outcome in outcomes {
            match outcome {
                Ok(true) => processed_any = true,
                Ok(false) => {}
                Err(error) => fatal = Some(error),
            }
        }
        if let Some(error) = fatal {
            break Err(error);
        }

        if !processed_any {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(cfg.poll_ms)) => {}
            }
        }
    };

    reclaimer.abort();
    tracing::info!("worker loop stopped");
    result
}

/// One claim slot: claim, dispatch, settle. Returns whether a job was
/// processed. Transient engine trouble counts as an idle slot; anything else
/// from the engine is fatal.
async fn run_one(
    store: &PgQueue,
    registry: &HandlerRegistry,
    worker_id: &str,
) -> anyhow::Result<bool> {
    let claimed = match store.claim(worker_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return Ok(false),
        Err(error) if error.is_transient() => {
            tracing::warn!(%error, "claim failed, retrying next tick");
            return Ok(false);
        }
        Err(error) => return Err(error.into()),
    };

    let span = tracing::info_span!(
        "job",
        job_id = claimed.id,
        job_type = %claimed.job_type,
        attempt = claimed.attempts
    );

    async {
        let started_at = Utc::now();

        let outcome = match registry.get(&claimed.job_type) {
            Some(handler) => {
                AssertUnwindSafe(handler(store.pool().clone(), claimed.payload.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))
                    })
            }
            None => Err(anyhow::anyhow!(
                "No handler registered for job type {}",
                claimed.job_type
            )),
        };

        match outcome {
            Ok(value) => {
                let summary = serde_json::to_string(&value).unwrap_or_else(|_| "null".into());
                tracing::info!("job succeeded");
                if let Err(error) = store.succeed(&claimed, started_at, Some(&summary)).await {
                    if !error.is_transient() {
                        return Err(error.into());
                    }
                    tracing::warn!(%error, "could not record success; lease reclaim will retry the job");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "job failed");
                let failure = HandlerFailure::new(error.to_string(), Some(format!("{error:?}")));
                if let Err(error) = store.fail(&claimed, started_at, &failure).await {
                    if !error.is_transient() {
                        return Err(error.into());
                    }
                    tracing::warn!(%error, "could not record failure; lease reclaim will retry the job");
                }
            }
        }

        Ok(true)
    }
    .instrument(span)
    .await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(error) => {
                tracing::warn!(%error, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_id_is_host_dash_pid() {
        let id = default_worker_id();
        let pid = std::process::id().to_string();
        assert!(id.ends_with(&pid));
        assert!(id.len() > pid.len());
        assert!(id.contains('-'));
    }

    #[test]
    fn env_clamping_applies_bounds_and_default() {
        std::env::remove_var("JOBQ_TEST_MISSING");
        assert_eq!(env_clamped("JOBQ_TEST_MISSING", 2, 1, 32), 2);

        std::env::set_var("JOBQ_TEST_CONCURRENCY", "100");
        assert_eq!(env_clamped("JOBQ_TEST_CONCURRENCY", 2, 1, 32), 32);

        std::env::set_var("JOBQ_TEST_CONCURRENCY", "0");
        assert_eq!(env_clamped("JOBQ_TEST_CONCURRENCY", 2, 1, 32), 1);

        std::env::set_var("JOBQ_TEST_CONCURRENCY", "not-a-number");
        assert_eq!(env_clamped("JOBQ_TEST_CONCURRENCY", 2, 1, 32), 2);
    }

    #[test]
    fn panic_payloads_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str panic");
        assert_eq!(panic_message(&*boxed), "static str panic");

        let boxed: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(&*boxed), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
