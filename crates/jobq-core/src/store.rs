use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{HandlerFailure, Job, JobId, JobRun, JobStatus, NewJob, QueueError};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

/// Clamp a read-side limit into `[1, MAX_LIST_LIMIT]`, defaulting to
/// `DEFAULT_LIST_LIMIT`.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Durable job store. The engine owns every write to `job_queue` and
/// `job_runs`; workers hold a claim only between a successful `claim` and the
/// matching `succeed`/`fail` call, bounded by the wall-clock lease.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or coalesce a job. On a `(type, key)` conflict the existing row
    /// is reset unless it is currently running.
    async fn enqueue(&self, req: NewJob) -> Result<Job, QueueError>;

    /// Claim the earliest-due eligible job for `worker_id`, bumping its
    /// attempt count. Returns `None` when nothing is runnable.
    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Record a successful attempt and settle the job as `succeeded`.
    async fn succeed(
        &self,
        claim: &Job,
        started_at: DateTime<Utc>,
        result_summary: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Record a failed attempt; schedules a retry with backoff or
    /// dead-letters the job when its attempt budget is spent.
    async fn fail(
        &self,
        claim: &Job,
        started_at: DateTime<Utc>,
        error: &HandlerFailure,
    ) -> Result<(), QueueError>;

    /// Return every job whose lease expired more than `lease_seconds` ago to
    /// `retrying`. Returns the number of reclaimed rows. No run is written:
    /// runs record observed completions only.
    async fn reclaim_stale(&self, lease_seconds: i64) -> Result<u64, QueueError>;

    /// Newest `updated_at` first.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Job>, QueueError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Runs for one job, latest attempt first.
    async fn list_runs(&self, job_id: JobId, limit: Option<i64>)
        -> Result<Vec<JobRun>, QueueError>;

    /// Database round-trip returning the server clock; backs health checks.
    async fn db_now(&self) -> Result<DateTime<Utc>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_into_bounds() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-3)), 1);
        assert_eq!(clamp_limit(Some(200)), 200);
        assert_eq!(clamp_limit(Some(10_000)), 200);
    }
}
