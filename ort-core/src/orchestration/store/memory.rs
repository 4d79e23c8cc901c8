use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use ort_model::{
    JobConfig, JobId, JobStatus, JobUpdate, NewOrtRun, OrtRun, OrtRunStatus,
    RunId, Stage, WorkerJob,
};

use super::{
    ClaimStatus, JobStore, MaintenanceClaims, OrchestrationStore, RunStore,
    StoreTransaction,
};
use crate::error::{OrchestratorError, Result};

/// Process-local store. Writes of a transaction are staged and applied
/// atomically on commit; run locks are per-run async mutexes, dropped once
/// the run is terminal.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    run_locks: DashMap<RunId, Arc<Mutex<()>>>,
    claims: Mutex<HashMap<String, Claim>>,
    next_run_id: AtomicI64,
    next_job_id: AtomicI64,
}

#[derive(Default)]
struct State {
    runs: BTreeMap<RunId, OrtRun>,
    jobs: BTreeMap<JobId, WorkerJob>,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    status: ClaimStatus,
    updated_at: DateTime<Utc>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("locked_runs", &self.inner.run_locks.len())
            .field("next_run_id", &self.inner.next_run_id.load(Ordering::Relaxed))
            .field("next_job_id", &self.inner.next_job_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a job's timestamps. Lets tests age records without a clock.
    pub async fn backdate_job(
        &self,
        id: JobId,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))?;
        job.created_at = created_at;
        if let Some(started_at) = job.started_at.as_mut() {
            *started_at = (*started_at).max(created_at);
        }
        Ok(())
    }

    /// Overwrites a run's `updated_at`.
    pub async fn backdate_run(
        &self,
        id: RunId,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {id}")))?;
        run.updated_at = updated_at;
        Ok(())
    }

    fn run_lock(&self, id: RunId) -> Arc<Mutex<()>> {
        self.inner
            .run_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl OrchestrationStore for InMemoryStore {
    async fn begin(
        &self,
        lock: Option<RunId>,
    ) -> Result<Box<dyn StoreTransaction>> {
        let guard = match lock {
            Some(id) => Some(self.run_lock(id).lock_owned().await),
            None => None,
        };

        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            locked: lock,
            guard,
            runs: BTreeMap::new(),
            jobs: BTreeMap::new(),
            deleted_jobs: BTreeSet::new(),
        }))
    }
}

struct InMemoryTransaction {
    inner: Arc<Inner>,
    locked: Option<RunId>,
    guard: Option<OwnedMutexGuard<()>>,
    runs: BTreeMap<RunId, OrtRun>,
    jobs: BTreeMap<JobId, WorkerJob>,
    deleted_jobs: BTreeSet<JobId>,
}

impl InMemoryTransaction {
    async fn load_run(&self, id: RunId) -> Option<OrtRun> {
        if let Some(run) = self.runs.get(&id) {
            return Some(run.clone());
        }
        self.inner.state.lock().await.runs.get(&id).cloned()
    }

    async fn load_job(&self, id: JobId) -> Option<WorkerJob> {
        if self.deleted_jobs.contains(&id) {
            return None;
        }
        if let Some(job) = self.jobs.get(&id) {
            return Some(job.clone());
        }
        self.inner.state.lock().await.jobs.get(&id).cloned()
    }

    /// Every job visible to this transaction.
    async fn visible_jobs(&self) -> Vec<WorkerJob> {
        let state = self.inner.state.lock().await;
        let mut merged: BTreeMap<JobId, WorkerJob> = state
            .jobs
            .iter()
            .filter(|(id, _)| !self.deleted_jobs.contains(id))
            .map(|(id, job)| (*id, job.clone()))
            .collect();
        merged.extend(self.jobs.iter().map(|(id, job)| (*id, job.clone())));
        merged.into_values().collect()
    }

    async fn touch_run(&mut self, id: RunId, at: DateTime<Utc>) {
        if let Some(mut run) = self.load_run(id).await {
            run.updated_at = run.updated_at.max(at);
            self.runs.insert(id, run);
        }
    }
}

#[async_trait]
impl RunStore for InMemoryTransaction {
    async fn create_run(&mut self, run: NewOrtRun) -> Result<OrtRun> {
        let id = RunId(self.inner.next_run_id.fetch_add(1, Ordering::SeqCst) + 1);
        let now = Utc::now();
        let created = OrtRun {
            id,
            status: OrtRunStatus::Created,
            labels: run.labels,
            job_configs: run.job_configs,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        self.runs.insert(id, created.clone());
        Ok(created)
    }

    async fn get_run(&mut self, id: RunId) -> Result<Option<OrtRun>> {
        Ok(self.load_run(id).await)
    }

    async fn update_run_status(
        &mut self,
        id: RunId,
        status: OrtRunStatus,
    ) -> Result<OrtRun> {
        let mut run = self
            .load_run(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {id}")))?;

        if run.status.is_terminal() && run.status != status {
            return Err(OrchestratorError::InvalidState(format!(
                "run {id} is already {}",
                run.status
            )));
        }

        let now = Utc::now();
        run.status = status;
        run.updated_at = now;
        if status.is_terminal() {
            run.finished_at.get_or_insert(now);
        }
        self.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn list_active_runs(
        &mut self,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OrtRun>> {
        let state = self.inner.state.lock().await;
        let mut merged: BTreeMap<RunId, OrtRun> = state.runs.clone();
        drop(state);
        merged.extend(self.runs.iter().map(|(id, run)| (*id, run.clone())));

        Ok(merged
            .into_values()
            .filter(|run| run.status == OrtRunStatus::Active)
            .filter(|run| before.is_none_or(|before| run.updated_at < before))
            .collect())
    }
}

#[async_trait]
impl JobStore for InMemoryTransaction {
    async fn create_job(
        &mut self,
        stage: Stage,
        run_id: RunId,
        config: JobConfig,
    ) -> Result<WorkerJob> {
        if self.load_run(run_id).await.is_none() {
            return Err(OrchestratorError::NotFound(format!("run {run_id}")));
        }
        if self.get_job_for_run(stage, run_id).await?.is_some() {
            return Err(OrchestratorError::InvalidState(format!(
                "run {run_id} already has a {stage} job"
            )));
        }

        let id = JobId(self.inner.next_job_id.fetch_add(1, Ordering::SeqCst) + 1);
        let now = Utc::now();
        let job = WorkerJob {
            id,
            ort_run_id: run_id,
            stage,
            status: JobStatus::Created,
            created_at: now,
            started_at: None,
            finished_at: None,
            config,
        };
        self.jobs.insert(id, job.clone());
        self.touch_run(run_id, now).await;
        Ok(job)
    }

    async fn get_job(
        &mut self,
        stage: Stage,
        id: JobId,
    ) -> Result<Option<WorkerJob>> {
        Ok(self.load_job(id).await.filter(|job| job.stage == stage))
    }

    async fn get_job_for_run(
        &mut self,
        stage: Stage,
        run_id: RunId,
    ) -> Result<Option<WorkerJob>> {
        Ok(self
            .visible_jobs()
            .await
            .into_iter()
            .find(|job| job.stage == stage && job.ort_run_id == run_id))
    }

    async fn update_job(
        &mut self,
        stage: Stage,
        id: JobId,
        update: JobUpdate,
    ) -> Result<WorkerJob> {
        let mut job = self.require_job(stage, id).await?;

        if let Some(status) = update.status {
            if job.status.is_terminal() && status != job.status {
                return Err(OrchestratorError::InvalidState(format!(
                    "{stage} job {id} is already {}",
                    job.status
                )));
            }
        }

        update.apply_to(&mut job);
        if !job.has_ordered_timeline() {
            return Err(OrchestratorError::InvalidState(format!(
                "{stage} job {id} timestamps out of order: created {}, started {:?}, finished {:?}",
                job.created_at, job.started_at, job.finished_at
            )));
        }
        let touched = job.last_update();
        let run_id = job.ort_run_id;
        self.jobs.insert(id, job.clone());
        self.touch_run(run_id, touched).await;
        Ok(job)
    }

    async fn list_active_jobs(
        &mut self,
        stage: Stage,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkerJob>> {
        Ok(self
            .visible_jobs()
            .await
            .into_iter()
            .filter(|job| job.stage == stage && !job.is_terminal())
            .filter(|job| before.is_none_or(|before| job.created_at < before))
            .collect())
    }

    async fn delete_job(&mut self, stage: Stage, id: JobId) -> Result<()> {
        self.require_job(stage, id).await?;
        self.jobs.remove(&id);
        self.deleted_jobs.insert(id);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction {
            inner,
            locked,
            guard,
            runs,
            jobs,
            deleted_jobs,
        } = *self;
        let touched: BTreeSet<RunId> = runs.keys().copied().chain(locked).collect();

        let finished: Vec<RunId> = {
            let mut state = inner.state.lock().await;
            for id in &deleted_jobs {
                state.jobs.remove(id);
            }
            state.runs.extend(runs);
            state.jobs.extend(jobs);
            touched
                .into_iter()
                .filter(|id| state.runs.get(id).is_some_and(|run| run.is_terminal()))
                .collect()
        };

        // Locks of terminal runs are recreated on demand. Entries that another
        // transaction still holds or waits on stay.
        drop(guard);
        for id in finished {
            inner
                .run_locks
                .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        }
        Ok(())
    }
}

#[async_trait]
impl MaintenanceClaims for InMemoryStore {
    async fn try_claim(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut claims = self.inner.claims.lock().await;
        let held = claims.get(name).is_some_and(|claim| {
            claim.status == ClaimStatus::Active
                && claim.updated_at > now - stale_after
        });
        if held {
            return Ok(false);
        }
        claims.insert(
            name.to_string(),
            Claim {
                status: ClaimStatus::Active,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn release(
        &self,
        name: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut claims = self.inner.claims.lock().await;
        claims.insert(
            name.to_string(),
            Claim {
                status,
                updated_at: now,
            },
        );
        Ok(())
    }
}
