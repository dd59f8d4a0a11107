use thiserror::Error;

/// Errors surfaced by the coordination store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced while registering tasks or starting the scheduler.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("task {0:?} is already registered")]
    DuplicateTask(String),

    #[error("invalid schedule for task {task:?}: {reason}")]
    InvalidSchedule { task: String, reason: String },

    #[error("coordination store unreachable: {0}")]
    StoreUnreachable(#[from] StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
}
