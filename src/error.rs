use std::time::Duration;

/// Error enum mapping failures across the pipeline to retry categories.
///
/// Categories:
/// - Transient: network timeout, rate limit, storage contention -- worth retrying
/// - Permanent: source data gone or malformed -- dead-letter immediately
/// - Internal: claim conflicts and missing rows, handled by callers, never retried
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // Transient
    #[error("collaborator call timed out after {0:?}")]
    Timeout(Duration),

    #[error("collaborator rate-limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage contention: {0}")]
    Contention(#[source] sqlx::Error),

    // Permanent
    #[error("source has no listing for {0}")]
    SourceMissing(String),

    #[error("malformed collaborator payload: {0}")]
    MalformedPayload(String),

    // Internal
    #[error("task {0} is already being handled")]
    ClaimConflict(i64),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("product {0} not found")]
    ProductNotFound(String),

    #[error("invalid task transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: i64,
        from: String,
        to: String,
    },

    #[error("work queue closed")]
    QueueClosed,

    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Returns true if the failure is transient and the task should be retried
    /// (re-queued with backoff, subject to the attempt cap).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout(_)
                | PipelineError::RateLimited(_)
                | PipelineError::Transport(_)
                | PipelineError::Contention(_)
        )
    }

    /// Returns true if the failure is permanent and the task should be
    /// dead-lettered without retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceMissing(_) | PipelineError::MalformedPayload(_)
        )
    }
}

/// SQLite reports writer contention as SQLITE_BUSY / SQLITE_LOCKED; everything
/// else from the driver is a hard storage error.
impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let msg = db.message().to_lowercase();
                if msg.contains("database is locked") || msg.contains("database is busy") {
                    PipelineError::Contention(err)
                } else {
                    PipelineError::Storage(err)
                }
            }
            sqlx::Error::PoolTimedOut => PipelineError::Contention(err),
            _ => PipelineError::Storage(err),
        }
    }
}
