use chrono::{DateTime, Utc};

use crate::ids::{JobId, RunId};
use crate::run::JobConfig;
use crate::stage::Stage;
use crate::status::JobStatus;

/// The persisted record of one stage's execution within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerJob {
    /// Store assigned id.
    pub id: JobId,
    /// Run the job belongs to.
    pub ort_run_id: RunId,
    /// Stage the job executes.
    pub stage: Stage,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Set by the store on creation.
    pub created_at: DateTime<Utc>,
    /// Set once when the worker starts the job.
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `status` is terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Copied from the run when the job is created.
    pub config: JobConfig,
}

impl WorkerJob {
    /// The job has reached a final status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `created_at <= started_at <= finished_at` holds for the
    /// timestamps that are set.
    pub fn has_ordered_timeline(&self) -> bool {
        let started_ok = self
            .started_at
            .is_none_or(|started_at| started_at >= self.created_at);
        let finished_ok = self.finished_at.is_none_or(|finished_at| {
            finished_at >= self.started_at.unwrap_or(self.created_at)
        });
        started_ok && finished_ok
    }

    /// Most recent lifecycle timestamp of this job.
    pub fn last_update(&self) -> DateTime<Utc> {
        self.finished_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}

/// Partial update of a job; `None` leaves the field unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobUpdate {
    /// New status.
    pub status: Option<JobStatus>,
    /// Ignored when the job has already started.
    pub started_at: Option<DateTime<Utc>>,
    /// Defaults to now for terminal updates.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    /// Status change that keeps the timestamps.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Moves the job to RUNNING.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(at),
            finished_at: None,
        }
    }

    /// Terminal update. `status` must be terminal.
    pub fn finished(status: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            started_at: None,
            finished_at: Some(at),
        }
    }

    /// Applies the update, keeping `finished_at` consistent with the status.
    pub fn apply_to(&self, job: &mut WorkerJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(started_at) = self.started_at {
            job.started_at.get_or_insert(started_at);
        }
        if job.status.is_terminal() {
            let finished_at = self.finished_at.unwrap_or_else(Utc::now);
            job.finished_at.get_or_insert(finished_at);
        }
    }
}
