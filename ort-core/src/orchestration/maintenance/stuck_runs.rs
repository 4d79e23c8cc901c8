use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use ort_model::{Endpoint, JobStatus};

use crate::error::{OrchestratorError, Result};
use crate::orchestration::config::StuckRunsConfig;
use crate::orchestration::messages::{Message, MessageHeader, OrchestratorMessage};
use crate::orchestration::store::{JobStore, OrchestrationStore, RunStore};
use crate::orchestration::transport::MessagePublisher;

use super::MaintenanceJob;

/// Claim name of the sweep.
pub const STUCK_RUN_SWEEP: &str = "stuck-run-sweep";

/// Finds ACTIVE runs that have not been updated for `min_age` and either have
/// no job in progress or hold a job that stayed CREATED for `min_age`, and
/// asks the orchestrator to re-evaluate them.
///
/// Staleness is a heuristic: a slow worker that never touches its job can be
/// swept if `min_age` is too short.
pub struct StuckRunSweep {
    store: Arc<dyn OrchestrationStore>,
    publisher: MessagePublisher,
    config: StuckRunsConfig,
}

impl fmt::Debug for StuckRunSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StuckRunSweep")
            .field("interval", &self.config.interval())
            .field("min_age", &self.config.min_age())
            .finish()
    }
}

impl StuckRunSweep {
    /// Sweep reading from `store` and reporting through `publisher`.
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        publisher: MessagePublisher,
        config: StuckRunsConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }
}

#[async_trait]
impl MaintenanceJob for StuckRunSweep {
    fn name(&self) -> &'static str {
        STUCK_RUN_SWEEP
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let started = Instant::now();
        let min_age = chrono::Duration::from_std(self.config.min_age()).map_err(|err| {
            OrchestratorError::Configuration(format!("stuck run min_age out of range: {err}"))
        })?;

        let mut candidates = Vec::new();
        {
            let mut tx = self.store.begin(None).await?;
            let cutoff = now - min_age;
            let runs = tx.list_active_runs(Some(cutoff)).await?;
            for run in runs {
                let jobs = tx.jobs_for_run(run.id).await?;
                let unpublished = jobs.iter().any(|job| {
                    job.status == JobStatus::Created && job.created_at < cutoff
                });
                if unpublished || jobs.iter().all(|job| job.is_terminal()) {
                    candidates.push(run.id);
                }
            }
        }

        let mut notified = 0;
        for run_id in candidates {
            let message = Message::new(
                MessageHeader::new(run_id),
                OrchestratorMessage::OrtRunStuckJobsError { ort_run_id: run_id },
            );
            match self.publisher.publish(Endpoint::Orchestrator, &message).await {
                Ok(()) => notified += 1,
                Err(err) => warn!(run_id = %run_id, "failed to report stuck run: {err}"),
            }
        }

        debug!(
            notified,
            duration_ms = started.elapsed().as_millis() as u64,
            "stuck run sweep finished"
        );
        Ok(notified)
    }
}
