//! Batch job records and their status machine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::{SchedulerError, SchedulerResult};
use crate::analysis::ConsensusResult;

/// Lifecycle of a batch job: `Queued → Running → {Done, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether `self → to` is a permitted transition.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running) | (Self::Running, Self::Done) | (Self::Running, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One master/dub pair as listed in a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub pair_id: String,
    pub master_path: PathBuf,
    pub dub_path: PathBuf,
}

/// A pair tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub pair_id: String,
    pub master_path: PathBuf,
    pub dub_path: PathBuf,
    /// Worker that ran the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<usize>,
    /// Accelerator whose memory the job reserved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_accelerator: Option<usize>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConsensusResult>,
}

impl BatchJob {
    /// Create a queued job.
    pub fn new(
        pair_id: impl Into<String>,
        master_path: impl Into<PathBuf>,
        dub_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pair_id: pair_id.into(),
            master_path: master_path.into(),
            dub_path: dub_path.into(),
            assigned_worker: None,
            assigned_accelerator: None,
            status: JobStatus::Queued,
            error: None,
            result: None,
        }
    }

    /// Move to `to`, rejecting anything outside the status machine.
    pub fn transition(&mut self, to: JobStatus) -> SchedulerResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                pair_id: self.pair_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

impl From<JobRequest> for BatchJob {
    fn from(request: JobRequest) -> Self {
        Self::new(request.pair_id, request.master_path, request.dub_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_allowed() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Done));
        assert!(Running.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Done));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn transition_reports_offending_move() {
        let mut job = BatchJob::new("ep01", "/m.wav", "/d.wav");
        let err = job.transition(JobStatus::Done).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidTransition {
                pair_id: "ep01".to_string(),
                from: JobStatus::Queued,
                to: JobStatus::Done,
            }
        );
        assert_eq!(job.status, JobStatus::Queued);

        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn requests_deserialize_from_json() {
        let json = r#"[{"pair_id": "ep01", "master_path": "/a.wav", "dub_path": "/b.wav"}]"#;
        let requests: Vec<JobRequest> = serde_json::from_str(json).unwrap();
        let job = BatchJob::from(requests[0].clone());
        assert_eq!(job.pair_id, "ep01");
        assert_eq!(job.status, JobStatus::Queued);
    }
}
