//! Periodic background jobs.
//!
//! Jobs are registered explicitly through [`MaintenanceRegistry::builder`] and
//! handed to the runtime; there is no process-wide job list. Every execution
//! is guarded by a claim in [`MaintenanceClaims`] so that, with several
//! replicas sharing a store, roughly one of them runs each cycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::orchestration::store::{ClaimStatus, MaintenanceClaims};

/// Fails jobs that outlived their stage timeout.
pub mod job_timeouts;
/// Re-evaluation of runs that stopped making progress.
pub mod stuck_runs;

pub use job_timeouts::JobTimeoutSweep;
pub use stuck_runs::StuckRunSweep;

/// A periodic sweep. Runs at most once at a time across replicas.
#[async_trait]
pub trait MaintenanceJob: Send + Sync + fmt::Debug {
    /// Unique name, also the key of the job's claim.
    fn name(&self) -> &'static str;

    /// Time between two runs.
    fn interval(&self) -> Duration;

    /// Executes one cycle. Returns the number of messages enqueued.
    async fn run(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// The set of maintenance jobs of one process.
#[derive(Clone, Default)]
pub struct MaintenanceRegistry {
    jobs: Vec<Arc<dyn MaintenanceJob>>,
}

impl fmt::Debug for MaintenanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

impl MaintenanceRegistry {
    /// Starts an empty registry.
    pub fn builder() -> MaintenanceRegistryBuilder {
        MaintenanceRegistryBuilder::default()
    }

    /// Registered jobs in registration order.
    pub fn jobs(&self) -> &[Arc<dyn MaintenanceJob>] {
        &self.jobs
    }

    /// Names of the registered jobs in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    /// No job is registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Collects the jobs of a [`MaintenanceRegistry`].
#[derive(Default)]
pub struct MaintenanceRegistryBuilder {
    jobs: Vec<Arc<dyn MaintenanceJob>>,
}

impl fmt::Debug for MaintenanceRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceRegistryBuilder")
            .field("job_count", &self.jobs.len())
            .finish()
    }
}

impl MaintenanceRegistryBuilder {
    /// Adds a job. Names must be unique.
    pub fn register(mut self, job: Arc<dyn MaintenanceJob>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Fails on duplicate names or zero intervals.
    pub fn build(self) -> Result<MaintenanceRegistry> {
        for (idx, job) in self.jobs.iter().enumerate() {
            if job.interval().is_zero() {
                return Err(OrchestratorError::Configuration(format!(
                    "maintenance job {} has a zero interval",
                    job.name()
                )));
            }
            if self.jobs[..idx].iter().any(|other| other.name() == job.name()) {
                return Err(OrchestratorError::Configuration(format!(
                    "maintenance job {} registered twice",
                    job.name()
                )));
            }
        }
        Ok(MaintenanceRegistry { jobs: self.jobs })
    }
}

/// Runs every registered job on its own interval until shutdown.
#[derive(Clone)]
pub struct MaintenanceService {
    registry: MaintenanceRegistry,
    claims: Arc<dyn MaintenanceClaims>,
    stale_after: Duration,
}

impl fmt::Debug for MaintenanceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceService")
            .field("registry", &self.registry)
            .field("claims", &self.claims)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl MaintenanceService {
    /// Runner for `registry`, claiming through `claims`.
    pub fn new(
        registry: MaintenanceRegistry,
        claims: Arc<dyn MaintenanceClaims>,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            claims,
            stale_after,
        }
    }

    /// Spawns one loop per job. The first cycle runs after one interval.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.registry
            .jobs()
            .iter()
            .map(|job| {
                let job = Arc::clone(job);
                let service = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let interval = job.interval();
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!(job = job.name(), "maintenance job shutting down");
                                break;
                            }
                            _ = tokio::time::sleep(interval) => {
                                if let Err(err) = service.run_once(job.as_ref(), Utc::now()).await {
                                    warn!(job = job.name(), "maintenance job error: {err}");
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Claims and executes `job` once. Returns `None` if another execution
    /// holds the claim.
    pub async fn run_once(
        &self,
        job: &dyn MaintenanceJob,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>> {
        let stale_after = chrono::Duration::from_std(self.stale_after).map_err(|err| {
            OrchestratorError::Configuration(format!("claim_stale_after out of range: {err}"))
        })?;

        if !self.claims.try_claim(job.name(), now, stale_after).await? {
            debug!(job = job.name(), "maintenance job claimed elsewhere; skipping");
            return Ok(None);
        }

        let result = job.run(now).await;
        let status = match result {
            Ok(_) => ClaimStatus::Finished,
            Err(_) => ClaimStatus::Failed,
        };
        self.claims.release(job.name(), status, Utc::now()).await?;

        result.map(Some)
    }
}
