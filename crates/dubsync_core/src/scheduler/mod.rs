//! Batch scheduling of master/dub pairs.
//!
//! - `BatchJob`: one pair with its `queued → running → {done, failed}` status
//! - `AcceleratorPool`: per-device memory budget with round-robin placement
//! - `WorkScheduler`: worker threads pulling jobs under a single state lock
//! - `TrackLoader`: decoding hook supplied by the caller
//!
//! Failed jobs are never retried here; retry policy belongs to the caller.

mod accelerators;
mod errors;
mod job;
mod work_scheduler;

pub use accelerators::AcceleratorPool;
pub use errors::{SchedulerError, SchedulerResult};
pub use job::{BatchJob, JobRequest, JobStatus};
pub use work_scheduler::{Assignment, BatchSummary, SchedulerConfig, TrackLoader, WorkScheduler};
