use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;

pub type JobId = i64;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const MAX_ATTEMPTS_LIMIT: i32 = 50;

/// Upper bounds on strings persisted into `job_runs`.
pub const ERROR_MESSAGE_MAX: usize = 2000;
pub const RESULT_SUMMARY_MAX: usize = 2000;
pub const ERROR_STACK_MAX: usize = 8000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "succeeded" => Ok(JobStatus::Succeeded),
            "dead" => Ok(JobStatus::Dead),
            other => Err(QueueError::Internal(format!("unknown job status: {other}"))),
        }
    }
}

/// Current state of one logical unit of work.
///
/// `(type, key)` is unique: repeated enqueues of the same pair coalesce into
/// this row. Timestamps serialize as epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub key: String,
    pub payload: serde_json::Value,

    pub status: JobStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub run_after: DateTime<Utc>,

    pub attempts: i32,
    pub max_attempts: i32,

    pub locked_by: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub locked_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_error_at: Option<DateTime<Utc>>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "success" => Ok(RunStatus::Success),
            "fail" => Ok(RunStatus::Fail),
            other => Err(QueueError::Internal(format!("unknown run status: {other}"))),
        }
    }
}

/// Append-only record of one completed attempt.
///
/// Written on success/failure only; a stale-lease reclaim leaves no run.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobRun {
    pub id: i64,
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub key: String,
    pub attempt: i32,
    pub status: RunStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i32,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub result_summary: Option<String>,
}

/// Validated enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub key: String,
    pub payload: Option<serde_json::Value>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub run_after: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            key: key.into(),
            payload: None,
            run_after: None,
            max_attempts: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::InvalidInput("type must be non-empty".into()));
        }
        if self.key.trim().is_empty() {
            return Err(QueueError::InvalidInput("key must be non-empty".into()));
        }
        if let Some(max) = self.max_attempts {
            if max < 1 || max > MAX_ATTEMPTS_LIMIT {
                return Err(QueueError::InvalidInput(format!(
                    "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Failure report for a completed attempt, as observed by the worker.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub message: String,
    pub stack: Option<String>,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>, stack: Option<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            message
        };
        Self { message, stack }
    }
}

/// Truncate `s` to at most `max` characters, appending an ellipsis marker
/// when anything was dropped.
pub fn trim_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
