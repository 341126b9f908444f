//! Scheduler error types.

use thiserror::Error;

use super::job::JobStatus;

/// Errors from job bookkeeping and slot assignment.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// No accelerator has enough free memory right now. Retry later.
    #[error("No accelerator has {needed_mb} MiB free")]
    Capacity { needed_mb: u64 },

    #[error("Job '{pair_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        pair_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job already submitted: {0}")]
    DuplicateJob(String),

    #[error("Invalid scheduler config: {0}")]
    InvalidConfig(String),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
