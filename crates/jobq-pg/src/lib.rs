use chrono::{DateTime, Utc};
use jobq_core::{
    backoff, clamp_limit, trim_with_ellipsis, HandlerFailure, Job, JobId, JobRun, JobStatus,
    JobStore, NewJob, QueueError, RunStatus, DEFAULT_MAX_ATTEMPTS, ERROR_MESSAGE_MAX,
    ERROR_STACK_MAX, RESULT_SUMMARY_MAX,
};
use sqlx::{PgPool, Row};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Classify driver errors into the queue taxonomy. Contention and
/// connectivity failures are `Transient` (retry next tick); everything else
/// is `Internal`.
fn map_db_err(e: sqlx::Error) -> QueueError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QueueError::Transient(e.to_string())
        }
        sqlx::Error::Io(_) => QueueError::Transient(e.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001") | Some("40P01") | Some("55P03") => {
                QueueError::Transient(e.to_string())
            }
            _ => QueueError::Internal(e.to_string()),
        },
        _ => QueueError::Internal(e.to_string()),
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, QueueError> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| QueueError::Internal(e.to_string()))?;

    Ok(Job {
        id: row
            .try_get::<i64, _>("id")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        job_type: row
            .try_get::<String, _>("type")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        key: row
            .try_get::<String, _>("key")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        payload: row
            .try_get::<serde_json::Value, _>("payload")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        status: JobStatus::parse(&status_str)?,
        run_after: row
            .try_get::<DateTime<Utc>, _>("run_after")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        attempts: row
            .try_get::<i32, _>("attempts")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        max_attempts: row
            .try_get::<i32, _>("max_attempts")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        locked_by: row
            .try_get::<Option<String>, _>("locked_by")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        locked_at: row
            .try_get::<Option<DateTime<Utc>>, _>("locked_at")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        last_error: row
            .try_get::<Option<String>, _>("last_error")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        last_error_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_error_at")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
    })
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<JobRun, QueueError> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| QueueError::Internal(e.to_string()))?;

    Ok(JobRun {
        id: row
            .try_get::<i64, _>("id")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        job_id: row
            .try_get::<i64, _>("job_id")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        job_type: row
            .try_get::<String, _>("type")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        key: row
            .try_get::<String, _>("key")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        attempt: row
            .try_get::<i32, _>("attempt")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        status: RunStatus::parse(&status_str)?,
        started_at: row
            .try_get::<DateTime<Utc>, _>("started_at")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        finished_at: row
            .try_get::<DateTime<Utc>, _>("finished_at")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        duration_ms: row
            .try_get::<i32, _>("duration_ms")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        error_message: row
            .try_get::<Option<String>, _>("error_message")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        error_stack: row
            .try_get::<Option<String>, _>("error_stack")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
        result_summary: row
            .try_get::<Option<String>, _>("result_summary")
            .map_err(|e| QueueError::Internal(e.to_string()))?,
    })
}

fn elapsed_ms(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> i32 {
    (finished_at - started_at)
        .num_milliseconds()
        .clamp(0, i64::from(i32::MAX)) as i32
}

#[async_trait::async_trait]
impl JobStore for PgQueue {
    async fn enqueue(&self, req: NewJob) -> Result<Job, QueueError> {
        req.validate()?;

        let payload = req.payload.unwrap_or_else(|| serde_json::json!({}));
        let max_attempts = req.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        // Reset-unless-running: a running row keeps its payload, status,
        // schedule, and attempt count so in-flight work is never stomped.
        let row = sqlx::query(
            r#"
            INSERT INTO job_queue (type, key, payload, status, run_after, max_attempts)
            VALUES ($1, $2, $3, 'queued'::job_status, COALESCE($4, now()), $5)
            ON CONFLICT (type, key) DO UPDATE SET
                payload = CASE WHEN job_queue.status = 'running'::job_status
                               THEN job_queue.payload ELSE EXCLUDED.payload END,
                status = CASE WHEN job_queue.status = 'running'::job_status
                              THEN job_queue.status ELSE 'queued'::job_status END,
                run_after = CASE WHEN job_queue.status = 'running'::job_status
                                 THEN job_queue.run_after ELSE EXCLUDED.run_after END,
                attempts = CASE WHEN job_queue.status = 'running'::job_status
                                THEN job_queue.attempts ELSE 0 END,
                max_attempts = EXCLUDED.max_attempts,
                last_error = NULL,
                last_error_at = NULL,
                updated_at = now()
            RETURNING
                id, type, key, payload, status::text AS status, run_after,
                attempts, max_attempts, locked_by, locked_at,
                last_error, last_error_at, created_at, updated_at
            "#,
        )
        .bind(&req.job_type)
        .bind(&req.key)
        .bind(&payload)
        .bind(req.run_after)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        row_to_job(&row)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        // Single atomic statement: the locked SELECT feeds the UPDATE, and
        // SKIP LOCKED lets concurrent claimers scan past in-flight rows.
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id
                FROM job_queue
                WHERE (status = 'queued'::job_status OR status = 'retrying'::job_status)
                  AND run_after <= now()
                ORDER BY run_after ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE job_queue j
            SET status = 'running'::job_status,
                locked_by = $1,
                locked_at = now(),
                attempts = j.attempts + 1,
                updated_at = now()
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING
                j.id, j.type, j.key, j.payload, j.status::text AS status,
                j.run_after, j.attempts, j.max_attempts, j.locked_by,
                j.locked_at, j.last_error, j.last_error_at, j.created_at,
                j.updated_at
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn succeed(
        &self,
        claim: &Job,
        started_at: DateTime<Utc>,
        result_summary: Option<&str>,
    ) -> Result<(), QueueError> {
        let finished_at = Utc::now();
        let summary = result_summary.map(|s| trim_with_ellipsis(s, RESULT_SUMMARY_MAX));

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        sqlx::query(
            r#"
            INSERT INTO job_runs
                (job_id, type, key, attempt, status, started_at, finished_at,
                 duration_ms, result_summary)
            VALUES ($1, $2, $3, $4, 'success', $5, $6, $7, $8)
            "#,
        )
        .bind(claim.id)
        .bind(&claim.job_type)
        .bind(&claim.key)
        .bind(claim.attempts)
        .bind(started_at)
        .bind(finished_at)
        .bind(elapsed_ms(started_at, finished_at))
        .bind(summary)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'succeeded'::job_status,
                locked_by = NULL,
                locked_at = NULL,
                last_error = NULL,
                last_error_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(claim.id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)
    }

    async fn fail(
        &self,
        claim: &Job,
        started_at: DateTime<Utc>,
        error: &HandlerFailure,
    ) -> Result<(), QueueError> {
        let finished_at = Utc::now();
        let attempt = claim.attempts;
        let will_retry = attempt < claim.max_attempts;

        let message = trim_with_ellipsis(&error.message, ERROR_MESSAGE_MAX);
        let stack = error
            .stack
            .as_deref()
            .map(|s| trim_with_ellipsis(s, ERROR_STACK_MAX));
        let backoff_ms = backoff::backoff_ms(attempt) as i64;

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        sqlx::query(
            r#"
            INSERT INTO job_runs
                (job_id, type, key, attempt, status, started_at, finished_at,
                 duration_ms, error_message, error_stack)
            VALUES ($1, $2, $3, $4, 'fail', $5, $6, $7, $8, $9)
            "#,
        )
        .bind(claim.id)
        .bind(&claim.job_type)
        .bind(&claim.key)
        .bind(attempt)
        .bind(started_at)
        .bind(finished_at)
        .bind(elapsed_ms(started_at, finished_at))
        .bind(&message)
        .bind(stack)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        // Dead jobs keep their run_after; only retries get a new schedule.
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = CASE WHEN $2 THEN 'retrying'::job_status
                              ELSE 'dead'::job_status END,
                locked_by = NULL,
                locked_at = NULL,
                last_error = $3,
                last_error_at = now(),
                run_after = CASE WHEN $2
                                 THEN now() + ($4::bigint * interval '1 millisecond')
                                 ELSE run_after END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(claim.id)
        .bind(will_retry)
        .bind(&message)
        .bind(backoff_ms)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)
    }

    async fn reclaim_stale(&self, lease_seconds: i64) -> Result<u64, QueueError> {
        let affected = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'retrying'::job_status,
                locked_by = NULL,
                locked_at = NULL,
                run_after = now(),
                last_error = COALESCE(last_error, 'stale lease reclaimed'),
                last_error_at = now(),
                updated_at = now()
            WHERE status = 'running'::job_status
              AND locked_at < now() - ($1::bigint * interval '1 second')
            "#,
        )
        .bind(lease_seconds)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?
        .rows_affected();

        Ok(affected)
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Job>, QueueError> {
        let limit = clamp_limit(limit);

        let rows = match status {
            Some(status) => sqlx::query(
                r#"
                SELECT
                    id, type, key, payload, status::text AS status, run_after,
                    attempts, max_attempts, locked_by, locked_at,
                    last_error, last_error_at, created_at, updated_at
                FROM job_queue
                WHERE status = $1::job_status
                ORDER BY updated_at DESC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?,
            None => sqlx::query(
                r#"
                SELECT
                    id, type, key, payload, status::text AS status, run_after,
                    attempts, max_attempts, locked_by, locked_at,
                    last_error, last_error_at, created_at, updated_at
                FROM job_queue
                ORDER BY updated_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?,
        };

        rows.iter().map(row_to_job).collect()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, type, key, payload, status::text AS status, run_after,
                attempts, max_attempts, locked_by, locked_at,
                last_error, last_error_at, created_at, updated_at
            FROM job_queue
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_runs(
        &self,
        job_id: JobId,
        limit: Option<i64>,
    ) -> Result<Vec<JobRun>, QueueError> {
        let limit = clamp_limit(limit);

        let rows = sqlx::query(
            r#"
            SELECT
                id, job_id, type, key, attempt, status, started_at,
                finished_at, duration_ms, error_message, error_stack,
                result_summary
            FROM job_runs
            WHERE job_id = $1
            ORDER BY attempt DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter().map(row_to_run).collect()
    }

    async fn db_now(&self) -> Result<DateTime<Utc>, QueueError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now()")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }
}
