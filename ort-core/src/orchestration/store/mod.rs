//! Run and job persistence contracts.
//!
//! All reads and writes go through a [`StoreTransaction`] opened with
//! [`OrchestrationStore::begin`]. Naming a run when opening the transaction
//! locks that run until commit, which serializes handlers for the same run
//! across every orchestrator replica sharing the store.

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use ort_model::{
    JobConfig, JobId, JobStatus, JobUpdate, NewOrtRun, OrtRun, OrtRunStatus,
    RunId, Stage, WorkerJob,
};

use crate::error::{OrchestratorError, Result};

/// Process-local store for tests and single-node deployments.
pub mod memory;
/// PostgreSQL store with row-level run locks.
#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

/// Persisted runs.
#[async_trait]
pub trait RunStore: Send {
    /// Creates a run with status CREATED and a freshly assigned id.
    async fn create_run(&mut self, run: NewOrtRun) -> Result<OrtRun>;

    /// Looks a run up by id.
    async fn get_run(&mut self, id: RunId) -> Result<Option<OrtRun>>;

    /// Sets the status of a run. A terminal status is final: changing it
    /// afterwards fails with [`OrchestratorError::InvalidState`].
    async fn update_run_status(
        &mut self,
        id: RunId,
        status: OrtRunStatus,
    ) -> Result<OrtRun>;

    /// ACTIVE runs, optionally only those not updated since `before`.
    async fn list_active_runs(
        &mut self,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OrtRun>>;
}

/// Persisted worker jobs, addressed per stage.
#[async_trait]
pub trait JobStore: Send {
    /// Creates the job of `stage` for a run with status CREATED. A run has at
    /// most one job per stage.
    async fn create_job(
        &mut self,
        stage: Stage,
        run_id: RunId,
        config: JobConfig,
    ) -> Result<WorkerJob>;

    /// Looks a job up by id. A job of another stage is not found.
    async fn get_job(&mut self, stage: Stage, id: JobId)
    -> Result<Option<WorkerJob>>;

    /// The job of `stage` in the given run, if one was created.
    async fn get_job_for_run(
        &mut self,
        stage: Stage,
        run_id: RunId,
    ) -> Result<Option<WorkerJob>>;

    /// Applies a partial update. Fails with `NotFound` for unknown jobs and
    /// with `InvalidState` when changing the status of a terminal job.
    async fn update_job(
        &mut self,
        stage: Stage,
        id: JobId,
        update: JobUpdate,
    ) -> Result<WorkerJob>;

    /// Non-terminal jobs of `stage`, optionally only those created before
    /// `before`.
    async fn list_active_jobs(
        &mut self,
        stage: Stage,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkerJob>>;

    /// Removes a job. Fails with `NotFound` for unknown jobs.
    async fn delete_job(&mut self, stage: Stage, id: JobId) -> Result<()>;

    /// All jobs of a run, in pipeline order.
    async fn jobs_for_run(&mut self, run_id: RunId) -> Result<Vec<WorkerJob>> {
        let mut jobs = Vec::new();
        for stage in Stage::ALL {
            if let Some(job) = self.get_job_for_run(stage, run_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Marks a job RUNNING. Fails if it was already started.
    async fn start_job(&mut self, stage: Stage, id: JobId) -> Result<WorkerJob> {
        self.try_start_job(stage, id).await?.ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "{stage} job {id} was already started"
            ))
        })
    }

    /// Marks a job RUNNING unless it was already started or completed.
    async fn try_start_job(
        &mut self,
        stage: Stage,
        id: JobId,
    ) -> Result<Option<WorkerJob>> {
        let job = self.require_job(stage, id).await?;
        if job.started_at.is_some() || job.is_terminal() {
            return Ok(None);
        }
        self.update_job(stage, id, JobUpdate::started(Utc::now()))
            .await
            .map(Some)
    }

    /// Completes a job with a terminal status. Fails if already completed.
    async fn complete_job(
        &mut self,
        stage: Stage,
        id: JobId,
        status: JobStatus,
    ) -> Result<WorkerJob> {
        self.try_complete_job(stage, id, status)
            .await?
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!(
                    "{stage} job {id} was already completed"
                ))
            })
    }

    /// Completes a job unless it is already terminal.
    async fn try_complete_job(
        &mut self,
        stage: Stage,
        id: JobId,
        status: JobStatus,
    ) -> Result<Option<WorkerJob>> {
        if !status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "{status} is not a terminal job status"
            )));
        }
        let job = self.require_job(stage, id).await?;
        if job.is_terminal() {
            return Ok(None);
        }
        self.update_job(stage, id, JobUpdate::finished(status, Utc::now()))
            .await
            .map(Some)
    }

    /// Like `get_job`, but a missing job is `NotFound`.
    async fn require_job(&mut self, stage: Stage, id: JobId) -> Result<WorkerJob> {
        self.get_job(stage, id).await?.ok_or_else(|| {
            OrchestratorError::NotFound(format!("{stage} job {id}"))
        })
    }
}

/// Unit of work over runs and jobs. Dropping it without [`commit`] discards
/// its writes and releases the run lock.
///
/// [`commit`]: StoreTransaction::commit
#[async_trait]
pub trait StoreTransaction: RunStore + JobStore + Send {
    /// Applies the writes and releases the run lock.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Entry point to a store.
#[async_trait]
pub trait OrchestrationStore: Send + Sync + Debug {
    /// Opens a transaction, locking `lock` for its duration when given.
    async fn begin(
        &self,
        lock: Option<RunId>,
    ) -> Result<Box<dyn StoreTransaction>>;
}

/// State of a maintenance job claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    /// The job is running.
    Active,
    /// The last run completed.
    Finished,
    /// The last run returned an error.
    Failed,
}

impl ClaimStatus {
    /// Stored name.
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Active => "ACTIVE",
            ClaimStatus::Finished => "FINISHED",
            ClaimStatus::Failed => "FAILED",
        }
    }
}

/// Cross-replica bookkeeping for maintenance jobs.
///
/// A claim counts as held while it is ACTIVE and was updated within
/// `stale_after`. This is a heuristic: a replica that is alive but slower
/// than `stale_after` loses its claim, and clock skew between replicas
/// shifts the window.
#[async_trait]
pub trait MaintenanceClaims: Send + Sync + Debug {
    /// Claims the maintenance job `name`. Returns `false` if another
    /// execution holds a fresh claim.
    async fn try_claim(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool>;

    /// Releases a claim with a final status.
    async fn release(
        &self,
        name: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
