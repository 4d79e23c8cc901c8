//! Postgres-backed run and job store.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use ort_model::{
    JobConfig, JobConfigurations, JobId, JobStatus, JobUpdate, NewOrtRun,
    OrtRun, OrtRunStatus, RunId, Stage, WorkerJob,
};

use super::{
    ClaimStatus, JobStore, MaintenanceClaims, OrchestrationStore, RunStore,
    StoreTransaction,
};
use crate::error::{OrchestratorError, Result};

/// Store backed by the `ort_runs` and `worker_jobs` tables. Per-run
/// serialization uses `SELECT ... FOR UPDATE` on the run row.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    /// Wraps an existing pool after verifying the database is reachable.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                OrchestratorError::Internal(format!(
                    "Orchestrator store failed Postgres health check: {e}"
                ))
            })?;
        info!("Orchestrator store connected to Postgres");
        Ok(Self { pool })
    }

    /// Opens a pool against `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::new(pool).await
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR.run(&self.pool).await?;
        info!("Orchestrator migrations applied");
        Ok(())
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrchestrationStore for PostgresStore {
    async fn begin(
        &self,
        lock: Option<RunId>,
    ) -> Result<Box<dyn StoreTransaction>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::Internal(format!("begin transaction failed: {e}"))
        })?;

        if let Some(run_id) = lock {
            let locked =
                sqlx::query_scalar::<_, i64>("SELECT id FROM ort_runs WHERE id = $1 FOR UPDATE")
                    .bind(run_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if locked.is_none() {
                debug!(run_id = %run_id, "lock requested for unknown run");
            }
        }

        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    status: String,
    labels: Json<BTreeMap<String, String>>,
    job_configs: Json<JobConfigurations>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for OrtRun {
    type Error = OrchestratorError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(OrtRun {
            id: RunId(row.id),
            status: row.status.parse()?,
            labels: row.labels.0,
            job_configs: row.job_configs.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    ort_run_id: i64,
    stage: String,
    status: String,
    config: Json<JobConfig>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for WorkerJob {
    type Error = OrchestratorError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(WorkerJob {
            id: JobId(row.id),
            ort_run_id: RunId(row.ort_run_id),
            stage: row.stage.parse()?,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            config: row.config.0,
        })
    }
}

impl PgStoreTransaction {
    async fn touch_run(&mut self, run_id: RunId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE ort_runs SET updated_at = GREATEST(updated_at, $2) WHERE id = $1",
        )
        .bind(run_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgStoreTransaction {
    async fn create_run(&mut self, run: NewOrtRun) -> Result<OrtRun> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO ort_runs (status, labels, job_configs)
            VALUES ($1, $2, $3)
            RETURNING id, status, labels, job_configs, created_at, updated_at, finished_at
            "#,
        )
        .bind(OrtRunStatus::Created.as_str())
        .bind(Json(&run.labels))
        .bind(Json(&run.job_configs))
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn get_run(&mut self, id: RunId) -> Result<Option<OrtRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, status, labels, job_configs, created_at, updated_at, finished_at
            FROM ort_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(OrtRun::try_from).transpose()
    }

    async fn update_run_status(
        &mut self,
        id: RunId,
        status: OrtRunStatus,
    ) -> Result<OrtRun> {
        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM ort_runs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("run {id}")))?;

        let current: OrtRunStatus = current.parse()?;
        if current.is_terminal() && current != status {
            return Err(OrchestratorError::InvalidState(format!(
                "run {id} is already {current}"
            )));
        }

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE ort_runs
            SET status = $2,
                updated_at = NOW(),
                finished_at = CASE
                    WHEN $3 THEN COALESCE(finished_at, NOW())
                    ELSE NULL
                END
            WHERE id = $1
            RETURNING id, status, labels, job_configs, created_at, updated_at, finished_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn list_active_runs(
        &mut self,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OrtRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, status, labels, job_configs, created_at, updated_at, finished_at
            FROM ort_runs
            WHERE status = 'ACTIVE'
              AND ($1::timestamptz IS NULL OR updated_at < $1)
            ORDER BY id
            "#,
        )
        .bind(before)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(OrtRun::try_from).collect()
    }
}

#[async_trait]
impl JobStore for PgStoreTransaction {
    async fn create_job(
        &mut self,
        stage: Stage,
        run_id: RunId,
        config: JobConfig,
    ) -> Result<WorkerJob> {
        let run_exists =
            sqlx::query_scalar::<_, i64>("SELECT id FROM ort_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&mut *self.tx)
                .await?
                .is_some();
        if !run_exists {
            return Err(OrchestratorError::NotFound(format!("run {run_id}")));
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO worker_jobs (ort_run_id, stage, status, config)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ort_run_id, stage) DO NOTHING
            RETURNING id, ort_run_id, stage, status, config, created_at, started_at, finished_at
            "#,
        )
        .bind(run_id)
        .bind(stage.as_str())
        .bind(JobStatus::Created.as_str())
        .bind(Json(&config))
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "run {run_id} already has a {stage} job"
            ))
        })?;

        let job = WorkerJob::try_from(row)?;
        self.touch_run(run_id, job.created_at).await?;
        Ok(job)
    }

    async fn get_job(
        &mut self,
        stage: Stage,
        id: JobId,
    ) -> Result<Option<WorkerJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, ort_run_id, stage, status, config, created_at, started_at, finished_at
            FROM worker_jobs
            WHERE id = $1 AND stage = $2
            "#,
        )
        .bind(id)
        .bind(stage.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(WorkerJob::try_from).transpose()
    }

    async fn get_job_for_run(
        &mut self,
        stage: Stage,
        run_id: RunId,
    ) -> Result<Option<WorkerJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, ort_run_id, stage, status, config, created_at, started_at, finished_at
            FROM worker_jobs
            WHERE ort_run_id = $1 AND stage = $2
            "#,
        )
        .bind(run_id)
        .bind(stage.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(WorkerJob::try_from).transpose()
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

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE worker_jobs
            SET status = $2, started_at = $3, finished_at = $4
            WHERE id = $1
            RETURNING id, ort_run_id, stage, status, config, created_at, started_at, finished_at
            "#,
        )
        .bind(id)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.finished_at)
        .fetch_one(&mut *self.tx)
        .await?;

        let updated = WorkerJob::try_from(row)?;
        self.touch_run(updated.ort_run_id, updated.last_update()).await?;
        Ok(updated)
    }

    async fn list_active_jobs(
        &mut self,
        stage: Stage,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<WorkerJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, ort_run_id, stage, status, config, created_at, started_at, finished_at
            FROM worker_jobs
            WHERE stage = $1
              AND status IN ('CREATED', 'SCHEDULED', 'RUNNING')
              AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY id
            "#,
        )
        .bind(stage.as_str())
        .bind(before)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(WorkerJob::try_from).collect()
    }

    async fn delete_job(&mut self, stage: Stage, id: JobId) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM worker_jobs WHERE id = $1 AND stage = $2")
            .bind(id)
            .bind(stage.as_str())
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(OrchestratorError::NotFound(format!("{stage} job {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| {
            OrchestratorError::Internal(format!("commit transaction failed: {e}"))
        })
    }
}

#[async_trait]
impl MaintenanceClaims for PostgresStore {
    async fn try_claim(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let claimed = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO maintenance_jobs (name, status, started_at, updated_at)
            VALUES ($1, 'ACTIVE', $2, $2)
            ON CONFLICT (name) DO UPDATE
            SET status = 'ACTIVE',
                started_at = EXCLUDED.started_at,
                updated_at = EXCLUDED.updated_at,
                finished_at = NULL
            WHERE maintenance_jobs.status <> 'ACTIVE'
               OR maintenance_jobs.updated_at <= $3
            RETURNING name
            "#,
        )
        .bind(name)
        .bind(now)
        .bind(now - stale_after)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn release(
        &self,
        name: &str,
        status: ClaimStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE maintenance_jobs
            SET status = $2,
                updated_at = $3,
                finished_at = CASE WHEN $2 = 'ACTIVE' THEN NULL ELSE $3 END
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
