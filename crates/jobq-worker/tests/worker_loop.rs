use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jobq_core::{Job, JobStatus, JobStore, NewJob, RunStatus};
use jobq_pg::{PgQueue, MIGRATOR};
use jobq_worker::{run_worker, HandlerRegistry, WorkerConfig};
use serde_json::json;
use serial_test::serial;
use sqlx::{postgres::PgPoolOptions, PgPool};

async fn setup() -> anyhow::Result<PgQueue> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set for integration tests")?;

    let pool: PgPool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    MIGRATOR.run(&pool).await?;

    sqlx::query("TRUNCATE TABLE job_runs, job_queue, locations RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await?;

    Ok(PgQueue::new(pool))
}

fn test_cfg(worker_id: &str, concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        worker_id: worker_id.to_string(),
        concurrency,
        poll_ms: 100,
        lease_seconds: 120,
    }
}

/// Poll until the job reaches `want`. With `fast_forward` set, any observed
/// backoff schedule is collapsed so retries run immediately.
async fn wait_for_status(
    store: &PgQueue,
    job_id: i64,
    want: JobStatus,
    fast_forward: bool,
) -> anyhow::Result<Job> {
    for _ in 0..200 {
        let job = store.get_job(job_id).await?.context("job disappeared")?;
        if job.status == want {
            return Ok(job);
        }
        if fast_forward && job.status == JobStatus::Retrying {
            sqlx::query("UPDATE job_queue SET run_after = now() WHERE id = $1")
                .bind(job_id)
                .execute(store.pool())
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("timed out waiting for job {job_id} to reach {want:?}")
}

#[tokio::test]
#[serial]
async fn ping_job_runs_to_success() -> anyhow::Result<()> {
    let store = setup().await?;

    let job = store
        .enqueue(NewJob::new("ping", "ping:test").payload(json!({"msg": "hi"})))
        .await?;

    let worker = tokio::spawn(run_worker(
        store.clone(),
        HandlerRegistry::builtin(),
        test_cfg("t-ping", 1),
    ));

    let done = wait_for_status(&store, job.id, JobStatus::Succeeded, false).await?;
    worker.abort();

    assert_eq!(done.attempts, 1);
    assert!(done.locked_by.is_none());
    assert!(done.last_error.is_none());

    let runs = store.list_runs(job.id, None).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].attempt, 1);
    assert!(runs[0].duration_ms >= 0);
    assert_eq!(
        runs[0].result_summary.as_deref(),
        Some(r#"{"ok":true,"payload":{"msg":"hi"}}"#)
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn flaky_job_retries_then_succeeds() -> anyhow::Result<()> {
    let store = setup().await?;

    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register("flaky.once", move |_db, _payload| {
        let calls = seen.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first attempt fails");
            }
            Ok(json!({"recovered": true}))
        }
    });

    let before = store.db_now().await?;
    let job = store.enqueue(NewJob::new("flaky.once", "flaky:1")).await?;

    let worker = tokio::spawn(run_worker(
        store.clone(),
        registry,
        test_cfg("t-flaky", 1),
    ));

    let retrying = wait_for_status(&store, job.id, JobStatus::Retrying, false).await?;
    assert!(retrying.last_error.is_some());
    assert!(retrying.run_after >= before + chrono::Duration::milliseconds(10_000));

    let done = wait_for_status(&store, job.id, JobStatus::Succeeded, true).await?;
    worker.abort();

    assert_eq!(done.attempts, 2);
    let runs = store.list_runs(job.id, None).await?;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].attempt, 2);
    assert_eq!(runs[1].status, RunStatus::Fail);
    assert_eq!(runs[1].attempt, 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn hopeless_job_dead_letters() -> anyhow::Result<()> {
    let store = setup().await?;

    let mut registry = HandlerRegistry::new();
    registry.register("always.fails", |_db, _payload| async move {
        anyhow::bail!("nope")
    });

    let job = store
        .enqueue(NewJob::new("always.fails", "doomed:1").max_attempts(2))
        .await?;

    let worker = tokio::spawn(run_worker(
        store.clone(),
        registry,
        test_cfg("t-dead", 1),
    ));

    let dead = wait_for_status(&store, job.id, JobStatus::Dead, true).await?;
    worker.abort();

    assert_eq!(dead.attempts, 2);
    assert!(dead.locked_by.is_none());
    assert_eq!(dead.last_error.as_deref(), Some("nope"));

    let runs = store.list_runs(job.id, None).await?;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Fail));
    Ok(())
}

#[tokio::test]
#[serial]
async fn unregistered_type_fails_with_clear_error() -> anyhow::Result<()> {
    let store = setup().await?;

    let job = store
        .enqueue(NewJob::new("nosuch.type", "missing:1").max_attempts(1))
        .await?;

    let worker = tokio::spawn(run_worker(
        store.clone(),
        HandlerRegistry::builtin(),
        test_cfg("t-missing", 1),
    ));

    let dead = wait_for_status(&store, job.id, JobStatus::Dead, true).await?;
    worker.abort();

    assert_eq!(
        dead.last_error.as_deref(),
        Some("No handler registered for job type nosuch.type")
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn duplicate_location_enqueues_coalesce_and_upsert_once() -> anyhow::Result<()> {
    let store = setup().await?;

    let payload = json!({"lat": 43.25512, "lon": -79.87149});
    let first = store
        .enqueue(NewJob::new("location.upsert", "location:test").payload(payload.clone()))
        .await?;
    let second = store
        .enqueue(NewJob::new("location.upsert", "location:test").payload(payload))
        .await?;
    assert_eq!(first.id, second.id);

    let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(jobs, 1);

    let worker = tokio::spawn(run_worker(
        store.clone(),
        HandlerRegistry::builtin(),
        test_cfg("t-location", 1),
    ));

    wait_for_status(&store, first.id, JobStatus::Succeeded, false).await?;
    worker.abort();

    let rows = sqlx::query_as::<_, (String, f64, f64)>("SELECT key, lat, lon FROM locations")
        .fetch_all(store.pool())
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "43.255,-79.871");
    assert_eq!(rows[0].1, 43.255);
    assert_eq!(rows[0].2, -79.871);
    Ok(())
}

#[tokio::test]
#[serial]
async fn two_workers_split_the_queue_without_double_claims() -> anyhow::Result<()> {
    let store = setup().await?;

    let mut ids = Vec::new();
    for i in 0..5 {
        let job = store
            .enqueue(NewJob::new("ping", format!("spread:{i}")))
            .await?;
        ids.push(job.id);
    }

    let w1 = tokio::spawn(run_worker(
        store.clone(),
        HandlerRegistry::builtin(),
        test_cfg("t-w1", 1),
    ));
    let w2 = tokio::spawn(run_worker(
        store.clone(),
        HandlerRegistry::builtin(),
        test_cfg("t-w2", 1),
    ));

    for id in &ids {
        let done = wait_for_status(&store, *id, JobStatus::Succeeded, false).await?;
        assert_eq!(done.attempts, 1);
        let runs = store.list_runs(*id, None).await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].attempt, 1);
    }
    w1.abort();
    w2.abort();
    Ok(())
}
