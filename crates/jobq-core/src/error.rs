use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    /// Contention or connectivity trouble worth retrying on the next poll
    /// tick: serialization conflicts, lock timeouts, pool exhaustion.
    #[error("transient database error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}
