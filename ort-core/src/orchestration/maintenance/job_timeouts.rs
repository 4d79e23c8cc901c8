use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use ort_model::{Endpoint, RunId, Stage};

use crate::error::{OrchestratorError, Result};
use crate::orchestration::config::JobTimeoutsConfig;
use crate::orchestration::messages::{Message, MessageHeader, OrchestratorMessage};
use crate::orchestration::store::{JobStore, OrchestrationStore, RunStore};
use crate::orchestration::transport::MessagePublisher;

use super::MaintenanceJob;

/// Claim name of the sweep.
pub const JOB_TIMEOUT_SWEEP: &str = "job-timeout-sweep";

/// Reports jobs that stayed active longer than their stage's timeout as
/// failed, on behalf of workers that crashed without reporting.
pub struct JobTimeoutSweep {
    store: Arc<dyn OrchestrationStore>,
    publisher: MessagePublisher,
    config: JobTimeoutsConfig,
    config_worker: bool,
}

impl fmt::Debug for JobTimeoutSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTimeoutSweep")
            .field("interval", &self.config.interval())
            .field("timeouts", &self.config.timeouts)
            .field("config_worker", &self.config_worker)
            .finish()
    }
}

impl JobTimeoutSweep {
    /// Sweep reading from `store` and reporting through `publisher`.
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        publisher: MessagePublisher,
        config: JobTimeoutsConfig,
        config_worker: bool,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            config_worker,
        }
    }

    async fn collect(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(RunId, OrchestratorMessage)>> {
        let mut expired = Vec::new();
        let mut tx = self.store.begin(None).await?;

        for stage in Stage::ALL {
            let cutoff = now - chrono_duration(self.config.timeouts.for_stage(stage))?;
            for job in tx.list_active_jobs(stage, Some(cutoff)).await? {
                info!(
                    run_id = %job.ort_run_id,
                    stage = %stage,
                    job_id = %job.id,
                    status = %job.status,
                    "job timed out"
                );
                expired.push((
                    job.ort_run_id,
                    OrchestratorMessage::worker_error(stage, job.id),
                ));
            }
        }

        // Runs that never got a job are waiting for the config worker.
        if self.config_worker {
            let cutoff =
                now - chrono_duration(Duration::from_secs(self.config.timeouts.config))?;
            for run in tx.list_active_runs(Some(cutoff)).await? {
                if tx.jobs_for_run(run.id).await?.is_empty() {
                    info!(run_id = %run.id, "configuration timed out");
                    expired.push((
                        run.id,
                        OrchestratorMessage::ConfigWorkerError { ort_run_id: run.id },
                    ));
                }
            }
        }

        Ok(expired)
    }
}

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|err| {
        OrchestratorError::Configuration(format!("job timeout out of range: {err}"))
    })
}

#[async_trait]
impl MaintenanceJob for JobTimeoutSweep {
    fn name(&self) -> &'static str {
        JOB_TIMEOUT_SWEEP
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let started = Instant::now();
        let expired = self.collect(now).await?;

        let mut notified = 0;
        for (run_id, payload) in expired {
            let message = Message::new(MessageHeader::new(run_id), payload);
            match self.publisher.publish(Endpoint::Orchestrator, &message).await {
                Ok(()) => notified += 1,
                Err(err) => warn!(run_id = %run_id, "failed to report timeout: {err}"),
            }
        }

        debug!(
            notified,
            duration_ms = started.elapsed().as_millis() as u64,
            "job timeout sweep finished"
        );
        Ok(notified)
    }
}
