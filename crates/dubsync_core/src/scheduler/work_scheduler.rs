//! Batch scheduler distributing pairs over workers and accelerators.
//!
//! All job-table and memory-counter mutations happen under one lock. Each
//! mutation is bounded to a single status transition, so a failing pair can
//! never leave a reservation behind.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::accelerators::AcceleratorPool;
use super::errors::{SchedulerError, SchedulerResult};
use super::job::{BatchJob, JobStatus};
use crate::analysis::{
    analyze_pair_with_cancel, AnalysisConfig, AnalysisResult, AudioTrack, CancelHandle,
    ConsensusResult, TrackRole,
};
use crate::config::Settings;
use crate::logging::{JobLogger, LogConfig};

/// Source of decoded audio for the scheduler.
///
/// Decoding lives outside the core; the CLI implements this with ffmpeg.
pub trait TrackLoader: Sync {
    /// Decode `path` to a mono track.
    fn load(&self, path: &Path, role: TrackRole) -> AnalysisResult<AudioTrack>;
}

impl<F> TrackLoader for F
where
    F: Fn(&Path, TrackRole) -> AnalysisResult<AudioTrack> + Sync,
{
    fn load(&self, path: &Path, role: TrackRole) -> AnalysisResult<AudioTrack> {
        self(path, role)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pairs analyzed concurrently.
    pub workers: usize,
    /// Memory of each accelerator in MiB.
    pub accelerator_memory_mb: Vec<u64>,
    /// Memory reserved per running job in MiB.
    pub job_memory_mb: u64,
    /// Folder for per-job logs; `None` disables them.
    pub log_dir: Option<PathBuf>,
    pub log: LogConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        let scheduler = &settings.scheduler;
        Self {
            workers: scheduler.workers,
            accelerator_memory_mb: scheduler.accelerator_memory_mb.clone(),
            job_memory_mb: scheduler.job_memory_mb,
            log_dir: if scheduler.log_dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(&scheduler.log_dir))
            },
            log: LogConfig::from(&settings.logging),
        }
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub pair_id: String,
    pub master_path: PathBuf,
    pub dub_path: PathBuf,
    pub worker: usize,
    pub accelerator: usize,
}

/// Outcome counts of a batch run plus the final job records.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    /// Jobs never started, e.g. after cancellation.
    pub queued: usize,
    pub jobs: Vec<BatchJob>,
}

struct SchedulerState {
    jobs: Vec<BatchJob>,
    pool: AcceleratorPool,
    running: usize,
}

impl SchedulerState {
    fn job_mut(&mut self, pair_id: &str) -> SchedulerResult<&mut BatchJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.pair_id == pair_id)
            .ok_or_else(|| SchedulerError::UnknownJob(pair_id.to_string()))
    }

    fn has_queued(&self) -> bool {
        self.jobs.iter().any(|j| j.status == JobStatus::Queued)
    }
}

/// Runs many pairs concurrently within worker and memory limits.
pub struct WorkScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    slot_freed: Condvar,
    cancel: CancelHandle,
}

impl WorkScheduler {
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        if config.workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        let pool = AcceleratorPool::new(config.accelerator_memory_mb.clone())?;
        if config.job_memory_mb == 0 || config.job_memory_mb > pool.largest_mb() {
            return Err(SchedulerError::InvalidConfig(format!(
                "job memory of {} MiB does not fit any accelerator",
                config.job_memory_mb
            )));
        }

        Ok(Self {
            config,
            state: Mutex::new(SchedulerState {
                jobs: Vec::new(),
                pool,
                running: 0,
            }),
            slot_freed: Condvar::new(),
            cancel: CancelHandle::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue a job. Pair ids must be unique.
    pub fn submit(&self, job: BatchJob) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        if state.jobs.iter().any(|j| j.pair_id == job.pair_id) {
            return Err(SchedulerError::DuplicateJob(job.pair_id));
        }
        if job.status != JobStatus::Queued {
            return Err(SchedulerError::InvalidTransition {
                pair_id: job.pair_id,
                from: job.status,
                to: JobStatus::Queued,
            });
        }
        tracing::debug!("Queued {}", job.pair_id);
        state.jobs.push(job);
        Ok(())
    }

    /// Snapshot of all jobs in submission order.
    pub fn jobs(&self) -> Vec<BatchJob> {
        self.state.lock().jobs.clone()
    }

    pub fn job(&self, pair_id: &str) -> Option<BatchJob> {
        self.state
            .lock()
            .jobs
            .iter()
            .find(|j| j.pair_id == pair_id)
            .cloned()
    }

    /// `(in_use, capacity)` MiB per accelerator.
    pub fn accelerator_usage(&self) -> Vec<(u64, u64)> {
        self.state.lock().pool.usage()
    }

    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Start the oldest queued job on `worker`.
    ///
    /// Returns `Ok(None)` when nothing is queued and `Capacity` when no
    /// accelerator has room; the job then stays queued.
    pub fn try_start(&self, worker: usize) -> SchedulerResult<Option<Assignment>> {
        let mut state = self.state.lock();
        Self::start_locked(&mut state, worker, self.config.job_memory_mb)
    }

    fn start_locked(
        state: &mut SchedulerState,
        worker: usize,
        job_memory_mb: u64,
    ) -> SchedulerResult<Option<Assignment>> {
        let Some(position) = state.jobs.iter().position(|j| j.status == JobStatus::Queued) else {
            return Ok(None);
        };

        let accelerator = state.pool.reserve(job_memory_mb)?;
        let job = &mut state.jobs[position];
        if let Err(e) = job.transition(JobStatus::Running) {
            state.pool.release(accelerator, job_memory_mb);
            return Err(e);
        }
        job.assigned_worker = Some(worker);
        job.assigned_accelerator = Some(accelerator);
        let assignment = Assignment {
            pair_id: job.pair_id.clone(),
            master_path: job.master_path.clone(),
            dub_path: job.dub_path.clone(),
            worker,
            accelerator,
        };
        state.running += 1;

        tracing::debug!(
            "Worker {} started {} on accelerator {}",
            worker,
            assignment.pair_id,
            accelerator
        );
        Ok(Some(assignment))
    }

    /// Record the outcome of a running job and release its memory.
    pub fn finish(
        &self,
        pair_id: &str,
        outcome: Result<ConsensusResult, String>,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        let job_memory_mb = self.config.job_memory_mb;

        let job = state.job_mut(pair_id)?;
        let target = if outcome.is_ok() {
            JobStatus::Done
        } else {
            JobStatus::Failed
        };
        job.transition(target)?;
        let accelerator = job.assigned_accelerator;
        match outcome {
            Ok(result) => job.result = Some(result),
            Err(e) => job.error = Some(e),
        }

        if let Some(index) = accelerator {
            state.pool.release(index, job_memory_mb);
        }
        state.running = state.running.saturating_sub(1);
        drop(state);

        self.slot_freed.notify_all();
        Ok(())
    }

    /// Stop handing out jobs and cancel running analyses at their next chunk
    /// boundary. Queued jobs stay queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _state = self.state.lock();
        self.slot_freed.notify_all();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every queued job to completion.
    ///
    /// # Arguments
    /// * `loader` - Decodes master and dub files
    /// * `analysis` - Configuration used for every pair
    ///
    /// # Returns
    /// Counts per final status and the job records. A failed pair never
    /// stops the batch.
    pub fn run(&self, loader: &dyn TrackLoader, analysis: &AnalysisConfig) -> BatchSummary {
        let total = self.state.lock().jobs.len();
        tracing::info!(
            "Running {} job(s) on {} worker(s), {} accelerator(s)",
            total,
            self.config.workers,
            self.config.accelerator_memory_mb.len()
        );

        std::thread::scope(|scope| {
            for worker in 0..self.config.workers {
                scope.spawn(move || self.worker_loop(worker, loader, analysis));
            }
        });

        self.summary()
    }

    /// Counts per status over the current job table.
    pub fn summary(&self) -> BatchSummary {
        let jobs = self.jobs();
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        let summary = BatchSummary {
            total: jobs.len(),
            done: count(JobStatus::Done),
            failed: count(JobStatus::Failed),
            queued: count(JobStatus::Queued),
            jobs: jobs.clone(),
        };
        tracing::info!(
            "Batch finished: {} done, {} failed, {} not started",
            summary.done,
            summary.failed,
            summary.queued
        );
        summary
    }

    fn worker_loop(&self, worker: usize, loader: &dyn TrackLoader, analysis: &AnalysisConfig) {
        while let Some(assignment) = self.next_assignment(worker) {
            let logger = self.job_logger(&assignment.pair_id);
            let outcome = self.process(&assignment, loader, analysis, logger.as_ref());

            if let Err(e) = self.finish(&assignment.pair_id, outcome) {
                tracing::error!("Failed to record {}: {}", assignment.pair_id, e);
            }
        }
        tracing::debug!("Worker {} idle", worker);
    }

    /// Block until a job can start, or return `None` when there is nothing
    /// left to start.
    fn next_assignment(&self, worker: usize) -> Option<Assignment> {
        let mut state = self.state.lock();
        loop {
            if self.cancel.is_cancelled() || !state.has_queued() {
                return None;
            }
            match Self::start_locked(&mut state, worker, self.config.job_memory_mb) {
                Ok(assignment) => return assignment,
                Err(SchedulerError::Capacity { .. }) if state.running > 0 => {
                    self.slot_freed.wait(&mut state);
                }
                Err(e) => {
                    tracing::error!("Worker {} cannot start a job: {}", worker, e);
                    return None;
                }
            }
        }
    }

    fn process(
        &self,
        assignment: &Assignment,
        loader: &dyn TrackLoader,
        analysis: &AnalysisConfig,
        logger: Option<&JobLogger>,
    ) -> Result<ConsensusResult, String> {
        let log = |line: &str| {
            if let Some(logger) = logger {
                logger.info(line);
            }
        };
        if let Some(logger) = logger {
            logger.phase(&assignment.pair_id);
        }
        log(&format!("Master: {}", assignment.master_path.display()));
        log(&format!("Dub: {}", assignment.dub_path.display()));
        log(&format!(
            "Worker {}, accelerator {}",
            assignment.worker, assignment.accelerator
        ));

        let run = || -> AnalysisResult<ConsensusResult> {
            let master = loader.load(&assignment.master_path, TrackRole::Master)?;
            let dub = loader.load(&assignment.dub_path, TrackRole::Dub)?;
            log(&format!(
                "Decoded {:.1}s master, {:.1}s dub",
                master.duration_secs(),
                dub.duration_secs()
            ));
            analyze_pair_with_cancel(&master, &dub, analysis, &self.cancel)
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(run)) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("analysis panicked".to_string()),
        };

        match (&outcome, logger) {
            (Ok(result), Some(logger)) if result.is_reliable() => logger.success(&result.statement),
            (Ok(result), Some(logger)) => logger.warn(&result.statement),
            (Err(e), Some(logger)) => {
                logger.error(e);
                logger.show_tail(&assignment.pair_id);
            }
            _ => {}
        }
        match &outcome {
            Ok(result) if result.is_reliable() => {
                tracing::info!("[{}] {}", assignment.pair_id, result.statement)
            }
            Ok(result) => tracing::warn!("[{}] {}", assignment.pair_id, result.statement),
            Err(e) => tracing::warn!("[{}] failed: {}", assignment.pair_id, e),
        }
        outcome
    }

    fn job_logger(&self, pair_id: &str) -> Option<JobLogger> {
        let dir = self.config.log_dir.as_ref()?;
        match JobLogger::new(pair_id, dir, self.config.log.clone(), None) {
            Ok(logger) => Some(logger),
            Err(e) => {
                tracing::warn!("No job log for {}: {}", pair_id, e);
                None
            }
        }
    }
}
