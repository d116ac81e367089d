pub mod backoff;
mod error;
mod job;
mod store;

pub use error::QueueError;
pub use job::{
    trim_with_ellipsis, HandlerFailure, Job, JobId, JobRun, JobStatus, NewJob, RunStatus,
    DEFAULT_MAX_ATTEMPTS, ERROR_MESSAGE_MAX, ERROR_STACK_MAX, MAX_ATTEMPTS_LIMIT,
    RESULT_SUMMARY_MAX,
};
pub use store::{clamp_limit, JobStore, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
