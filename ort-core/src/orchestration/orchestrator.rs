//! The orchestrator: the single authoritative mutator of run and job state.
//!
//! Every handler follows the same shape. It locks the run, reads the state,
//! decides, and commits. Trigger messages are published only after the lock
//! is released. A second short transaction then marks the published jobs
//! SCHEDULED. Domain failures (unknown jobs, duplicate or stale messages) are
//! logged and swallowed; only infrastructure errors reach the transport.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use ort_model::{
    Endpoint, JobStatus, JobUpdate, OrtRun, OrtRunStatus, RunId, Stage,
    WorkerJob,
};

use crate::error::{OrchestratorError, Result};
use crate::orchestration::config::OrchestratorConfig;
use crate::orchestration::graph::{RunProgress, StageGraph};
use crate::orchestration::messages::{
    Envelope, Message, MessageHeader, OrchestratorMessage, StageOutcome,
    WorkerRequest,
};
use crate::orchestration::store::{
    JobStore, OrchestrationStore, RunStore, StoreTransaction,
};
use crate::orchestration::transport::{MessageHandler, MessagePublisher};

/// What prompted a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    /// The run has just been started.
    Start,
    /// The job of this stage has just become terminal.
    After(Stage),
    /// Recompute everything from the stored state.
    Reevaluate,
}

/// Applies orchestrator messages to the stored runs and jobs.
pub struct Orchestrator {
    store: Arc<dyn OrchestrationStore>,
    publisher: MessagePublisher,
    graph: StageGraph,
    config: OrchestratorConfig,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("publisher", &self.publisher)
            .field("config_worker", &self.config.config_worker)
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator over `store` using the standard stage graph.
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        publisher: MessagePublisher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            graph: StageGraph::standard(),
            config,
        }
    }

    /// Stage ordering used for scheduling decisions.
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Handles one typed message. Domain errors are logged and swallowed.
    pub async fn dispatch(
        &self,
        message: Message<OrchestratorMessage>,
    ) -> Result<()> {
        let Message { header, payload } = message;
        let kind = payload.kind();
        debug!(
            kind,
            run_id = %header.ort_run_id,
            trace_id = %header.trace_id,
            token = %header.token,
            "handling orchestrator message"
        );

        let outcome = match payload {
            OrchestratorMessage::CreateOrtRun { run } => {
                self.handle_create_ort_run(&header, run.id).await
            }
            OrchestratorMessage::ConfigWorkerResult { ort_run_id } => {
                self.handle_config_worker_result(&header, ort_run_id).await
            }
            OrchestratorMessage::ConfigWorkerError { ort_run_id } => {
                self.handle_config_worker_error(ort_run_id).await
            }
            OrchestratorMessage::WorkerError { endpoint_name } => {
                self.handle_worker_error(&header, &endpoint_name).await
            }
            OrchestratorMessage::OrtRunStuckJobsError { ort_run_id } => {
                self.handle_stuck_jobs(&header, ort_run_id).await
            }
            other => match other.stage_outcome() {
                Some(outcome) => {
                    self.handle_stage_outcome(&header, outcome).await
                }
                None => Err(OrchestratorError::InvalidMessage(format!(
                    "no handler for {kind}"
                ))),
            },
        };

        match outcome {
            Err(err) if err.is_domain() => {
                warn!(
                    kind,
                    run_id = %header.ort_run_id,
                    trace_id = %header.trace_id,
                    "ignoring message: {err}"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Starts a run created by the API layer.
    pub async fn handle_create_ort_run(
        &self,
        header: &MessageHeader,
        run_id: RunId,
    ) -> Result<()> {
        let mut tx = self.store.begin(Some(run_id)).await?;
        let run = require_run(&mut *tx, run_id).await?;

        if run.status != OrtRunStatus::Created {
            debug!(run_id = %run_id, status = %run.status, "run already started");
            return tx.commit().await;
        }

        let run = tx.update_run_status(run_id, OrtRunStatus::Active).await?;
        info!(run_id = %run_id, from = %OrtRunStatus::Created, to = %run.status, "run status changed");

        if self.config.config_worker {
            tx.commit().await?;
            let request = Message::new(
                header.for_run(&run),
                WorkerRequest::ConfigRequest { ort_run_id: run_id },
            );
            self.publisher.publish(Endpoint::Config, &request).await?;
            info!(run_id = %run_id, "requested run configuration");
            return Ok(());
        }

        self.advance(tx, run, header, Advance::Start).await
    }

    /// The config worker resolved the run's configuration; start the pipeline.
    pub async fn handle_config_worker_result(
        &self,
        header: &MessageHeader,
        run_id: RunId,
    ) -> Result<()> {
        let mut tx = self.store.begin(Some(run_id)).await?;
        let run = require_run(&mut *tx, run_id).await?;

        if run.status != OrtRunStatus::Active {
            debug!(run_id = %run_id, status = %run.status, "config result for inactive run");
            return tx.commit().await;
        }
        if !tx.jobs_for_run(run_id).await?.is_empty() {
            debug!(run_id = %run_id, "duplicate config result");
            return tx.commit().await;
        }

        self.advance(tx, run, header, Advance::Start).await
    }

    /// Fails a run whose configuration could not be prepared.
    pub async fn handle_config_worker_error(&self, run_id: RunId) -> Result<()> {
        let mut tx = self.store.begin(Some(run_id)).await?;
        let run = require_run(&mut *tx, run_id).await?;

        if run.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "config error for finished run");
            return tx.commit().await;
        }

        finalize(&mut *tx, &run, OrtRunStatus::Failed).await?;
        tx.commit().await
    }

    /// A stage worker reported success or failure for its job.
    pub async fn handle_stage_outcome(
        &self,
        header: &MessageHeader,
        outcome: StageOutcome,
    ) -> Result<()> {
        let StageOutcome {
            stage,
            job_id,
            status,
        } = outcome;

        // The job decides which run to lock; the header is only a hint.
        let run_id = {
            let mut lookup = self.store.begin(None).await?;
            let job = lookup.get_job(stage, job_id).await?.ok_or_else(|| {
                OrchestratorError::InvalidMessage(format!(
                    "result for unknown {stage} job {job_id}"
                ))
            })?;
            job.ort_run_id
        };
        if run_id != header.ort_run_id {
            warn!(
                job_id = %job_id,
                header_run_id = %header.ort_run_id,
                run_id = %run_id,
                "message header names a different run than the job"
            );
        }

        let mut tx = self.store.begin(Some(run_id)).await?;
        let previous = tx.require_job(stage, job_id).await?.status;
        let Some(job) = tx.try_complete_job(stage, job_id, status).await? else {
            debug!(stage = %stage, job_id = %job_id, "job already completed; duplicate delivery");
            return tx.commit().await;
        };
        info!(
            run_id = %run_id,
            stage = %stage,
            job_id = %job_id,
            from = %previous,
            to = %job.status,
            "job status changed"
        );

        let run = require_run(&mut *tx, run_id).await?;
        if run.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "run already finished");
            return tx.commit().await;
        }

        self.advance(tx, run, header, Advance::After(stage)).await
    }

    /// A worker failed fatally without a job reference. The job of the
    /// endpoint's stage, if any, is failed and the run is failed with it.
    pub async fn handle_worker_error(
        &self,
        header: &MessageHeader,
        endpoint_name: &str,
    ) -> Result<()> {
        error!(
            endpoint = endpoint_name,
            run_id = %header.ort_run_id,
            trace_id = %header.trace_id,
            "fatal worker error"
        );

        let endpoint: Endpoint = endpoint_name
            .parse()
            .map_err(|err| OrchestratorError::InvalidMessage(format!("{err}")))?;
        let run_id = header.ort_run_id;
        let mut tx = self.store.begin(Some(run_id)).await?;
        let run = require_run(&mut *tx, run_id).await?;

        if let Some(stage) = endpoint.stage() {
            if let Some(job) = tx.get_job_for_run(stage, run_id).await? {
                if let Some(failed) =
                    tx.try_complete_job(stage, job.id, JobStatus::Failed).await?
                {
                    info!(
                        run_id = %run_id,
                        stage = %stage,
                        job_id = %failed.id,
                        from = %job.status,
                        to = %failed.status,
                        "job status changed"
                    );
                }
            }
        }

        if !run.is_terminal() {
            finalize(&mut *tx, &run, OrtRunStatus::Failed).await?;
        }
        tx.commit().await
    }

    /// Re-evaluates a run the sweep suspects to be stuck.
    pub async fn handle_stuck_jobs(
        &self,
        header: &MessageHeader,
        run_id: RunId,
    ) -> Result<()> {
        let mut tx = self.store.begin(Some(run_id)).await?;
        let run = require_run(&mut *tx, run_id).await?;

        if run.status != OrtRunStatus::Active {
            debug!(run_id = %run_id, status = %run.status, "stuck check for inactive run");
            return tx.commit().await;
        }

        let jobs = tx.jobs_for_run(run_id).await?;
        let min_age = chrono::Duration::from_std(self.config.monitor.stuck_runs.min_age())
            .map_err(|err| {
                OrchestratorError::Configuration(format!(
                    "stuck run min_age out of range: {err}"
                ))
            })?;
        let cutoff = Utc::now() - min_age;
        let unpublished: Vec<WorkerJob> = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Created && job.created_at < cutoff)
            .cloned()
            .collect();
        if !unpublished.is_empty() {
            tx.commit().await?;
            info!(
                run_id = %run_id,
                jobs = unpublished.len(),
                "republishing worker requests"
            );
            let published = self.publish_jobs(header, &run, unpublished).await;
            return self.mark_scheduled(run_id, published).await;
        }
        if jobs.iter().any(|job| !job.is_terminal()) {
            debug!(run_id = %run_id, "run still has active jobs");
            return tx.commit().await;
        }
        if jobs.is_empty() && self.config.config_worker {
            // Waiting for the config worker; its timeout covers this case.
            debug!(run_id = %run_id, "run is waiting for its configuration");
            return tx.commit().await;
        }

        info!(run_id = %run_id, jobs = jobs.len(), "re-evaluating stuck run");
        self.advance(tx, run, header, Advance::Reevaluate).await
    }

    /// Creates the jobs of the stages that are eligible now, or finalizes the
    /// run when nothing is left to do. Consumes the locked transaction.
    async fn advance(
        &self,
        mut tx: Box<dyn StoreTransaction>,
        run: OrtRun,
        header: &MessageHeader,
        reason: Advance,
    ) -> Result<()> {
        let jobs = tx.jobs_for_run(run.id).await?;
        let progress = RunProgress::new(&run, &jobs);
        let stages = match reason {
            Advance::Start if jobs.is_empty() => {
                self.graph.initial_stages(&run.job_configs)
            }
            Advance::After(stage) => self.graph.next_stages(stage, &progress),
            Advance::Start | Advance::Reevaluate => {
                self.graph.eligible_stages(&progress)
            }
        };

        if stages.is_empty() {
            if !progress.has_unfinished_jobs() {
                finalize(&mut *tx, &run, progress.final_status()).await?;
            }
            return tx.commit().await;
        }

        let mut created = Vec::with_capacity(stages.len());
        for stage in stages {
            let config = run.job_configs.get(stage).cloned().unwrap_or_default();
            let job = tx.create_job(stage, run.id, config).await?;
            info!(
                run_id = %run.id,
                stage = %stage,
                job_id = %job.id,
                status = %job.status,
                "job created"
            );
            created.push(job);
        }
        tx.commit().await?;

        let published = self.publish_jobs(header, &run, created).await;
        self.mark_scheduled(run.id, published).await
    }

    /// Publishes trigger messages without holding the run lock. Jobs whose
    /// message could not be sent stay CREATED until the stuck-run sweep
    /// reports the run again.
    async fn publish_jobs(
        &self,
        header: &MessageHeader,
        run: &OrtRun,
        jobs: Vec<WorkerJob>,
    ) -> Vec<WorkerJob> {
        let run_header = header.for_run(run);
        let mut published = Vec::with_capacity(jobs.len());

        for job in jobs {
            let request = Message::new(
                run_header.follow_up(),
                WorkerRequest::for_stage(job.stage, job.id),
            );
            match self.publisher.publish(job.stage.endpoint(), &request).await {
                Ok(()) => published.push(job),
                Err(err) => warn!(
                    run_id = %run.id,
                    stage = %job.stage,
                    job_id = %job.id,
                    "failed to publish worker request: {err}"
                ),
            }
        }

        published
    }

    async fn mark_scheduled(&self, run_id: RunId, jobs: Vec<WorkerJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.begin(Some(run_id)).await?;
        for job in jobs {
            let current = tx.get_job(job.stage, job.id).await?;
            // The worker may already have picked the job up.
            if current.is_some_and(|current| current.status == JobStatus::Created) {
                let scheduled = tx
                    .update_job(job.stage, job.id, JobUpdate::status(JobStatus::Scheduled))
                    .await?;
                info!(
                    run_id = %run_id,
                    stage = %job.stage,
                    job_id = %job.id,
                    from = %JobStatus::Created,
                    to = %scheduled.status,
                    "job status changed"
                );
            }
        }
        tx.commit().await
    }
}

async fn require_run(tx: &mut dyn StoreTransaction, run_id: RunId) -> Result<OrtRun> {
    tx.get_run(run_id)
        .await?
        .ok_or_else(|| OrchestratorError::InvalidMessage(format!("unknown run {run_id}")))
}

async fn finalize(
    tx: &mut dyn StoreTransaction,
    run: &OrtRun,
    status: OrtRunStatus,
) -> Result<()> {
    let finished = tx.update_run_status(run.id, status).await?;
    info!(
        run_id = %run.id,
        from = %run.status,
        to = %finished.status,
        "run status changed"
    );
    Ok(())
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        match envelope.decode::<OrchestratorMessage>() {
            Ok(message) => self.dispatch(message).await,
            Err(err) => {
                warn!(
                    run_id = %envelope.header.ort_run_id,
                    token = %envelope.header.token,
                    "dropping undecodable message: {err}"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::runtime::InMemoryTransport;
    use crate::orchestration::store::InMemoryStore;
    use crate::orchestration::config::StuckRunsConfig;
    use crate::orchestration::maintenance::{MaintenanceJob, StuckRunSweep};
    use crate::orchestration::transport::{MockTransport, Transport};
    use ort_model::{JobConfig, JobConfigurations, JobId, NewOrtRun};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;

    struct Harness {
        store: InMemoryStore,
        transport: Arc<InMemoryTransport>,
        orchestrator: Orchestrator,
    }

    impl Harness {
        fn new(config: OrchestratorConfig) -> Self {
            let store = InMemoryStore::new();
            let transport = Arc::new(InMemoryTransport::new());
            let publisher =
                MessagePublisher::new(Arc::clone(&transport) as Arc<dyn Transport>);
            let orchestrator =
                Orchestrator::new(Arc::new(store.clone()), publisher, config);
            Self {
                store,
                transport,
                orchestrator,
            }
        }

        async fn start(&self, stages: &[Stage]) -> OrtRun {
            let run = create_run(&self.store, stages).await;
            self.send(run.id, OrchestratorMessage::CreateOrtRun { run: run.clone() })
                .await;
            run
        }

        async fn send(&self, run_id: RunId, payload: OrchestratorMessage) {
            self.orchestrator
                .dispatch(Message::new(MessageHeader::new(run_id), payload))
                .await
                .expect("dispatch");
        }

        async fn finish(&self, run_id: RunId, stage: Stage, has_issues: bool) {
            let job = self.job(run_id, stage).await.expect("job exists");
            self.send(
                run_id,
                OrchestratorMessage::worker_result(stage, job.id, has_issues),
            )
            .await;
        }

        async fn fail(&self, run_id: RunId, stage: Stage) {
            let job = self.job(run_id, stage).await.expect("job exists");
            self.send(run_id, OrchestratorMessage::worker_error(stage, job.id))
                .await;
        }

        async fn run(&self, id: RunId) -> OrtRun {
            let mut tx = self.store.begin(None).await.expect("begin");
            tx.get_run(id).await.expect("get run").expect("run exists")
        }

        async fn job(&self, run_id: RunId, stage: Stage) -> Option<WorkerJob> {
            let mut tx = self.store.begin(None).await.expect("begin");
            tx.get_job_for_run(stage, run_id).await.expect("get job")
        }

        async fn stages(&self, run_id: RunId) -> Vec<Stage> {
            let mut tx = self.store.begin(None).await.expect("begin");
            tx.jobs_for_run(run_id)
                .await
                .expect("jobs")
                .into_iter()
                .map(|job| job.stage)
                .collect()
        }

        async fn requests(&self, endpoint: Endpoint) -> Vec<Message<WorkerRequest>> {
            self.transport
                .drain(endpoint)
                .await
                .iter()
                .map(|envelope| envelope.decode().expect("worker request"))
                .collect()
        }
    }

    async fn create_run(store: &InMemoryStore, stages: &[Stage]) -> OrtRun {
        let mut tx = store.begin(None).await.expect("begin");
        let run = tx
            .create_run(
                NewOrtRun::new(JobConfigurations::with_stages(stages))
                    .with_label("transport.queue", "fast"),
            )
            .await
            .expect("create run");
        tx.commit().await.expect("commit");
        run
    }

    #[tokio::test]
    async fn create_run_schedules_the_analyzer() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Active);
        let job = harness.job(run.id, Stage::Analyzer).await.expect("analyzer");
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);

        let requests = harness.requests(Endpoint::Analyzer).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].payload,
            WorkerRequest::AnalyzerRequest { job_id: job.id }
        );
        assert_eq!(
            requests[0].header.transport_properties.get("queue"),
            Some(&"fast".to_string())
        );
    }

    #[tokio::test]
    async fn duplicate_create_run_is_ignored() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;
        harness
            .send(run.id, OrchestratorMessage::CreateOrtRun { run: run.clone() })
            .await;

        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
        assert_eq!(harness.requests(Endpoint::Analyzer).await.len(), 1);
    }

    #[tokio::test]
    async fn run_without_enabled_stages_finishes_immediately() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&[]).await;

        let run = harness.run(run.id).await;
        assert_eq!(run.status, OrtRunStatus::Finished);
        assert!(run.finished_at.is_some());
        assert!(harness.stages(run.id).await.is_empty());
    }

    #[tokio::test]
    async fn full_pipeline_finishes_with_issues() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        harness.finish(run.id, Stage::Analyzer, false).await;
        assert_eq!(
            harness.stages(run.id).await,
            vec![Stage::Analyzer, Stage::Advisor, Stage::Scanner]
        );

        harness.finish(run.id, Stage::Advisor, false).await;
        assert!(harness.job(run.id, Stage::Evaluator).await.is_none());

        harness.finish(run.id, Stage::Scanner, true).await;
        harness.finish(run.id, Stage::Evaluator, false).await;
        harness.finish(run.id, Stage::Reporter, false).await;
        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Active);

        harness.finish(run.id, Stage::Notifier, false).await;
        assert_eq!(
            harness.run(run.id).await.status,
            OrtRunStatus::FinishedWithIssues
        );
        assert_eq!(harness.stages(run.id).await, Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn duplicate_results_are_ignored() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&[Stage::Analyzer, Stage::Advisor]).await;

        harness.finish(run.id, Stage::Analyzer, false).await;
        harness.finish(run.id, Stage::Analyzer, true).await;

        let analyzer = harness.job(run.id, Stage::Analyzer).await.expect("job");
        assert_eq!(analyzer.status, JobStatus::Finished);
        assert_eq!(harness.requests(Endpoint::Advisor).await.len(), 1);
    }

    #[tokio::test]
    async fn result_for_unknown_job_is_dropped() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        harness
            .send(
                run.id,
                OrchestratorMessage::worker_result(Stage::Scanner, JobId(9_999), false),
            )
            .await;

        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Active);
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
    }

    #[tokio::test]
    async fn analyzer_failure_still_reports_and_notifies() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        harness.fail(run.id, Stage::Analyzer).await;
        assert_eq!(
            harness.stages(run.id).await,
            vec![Stage::Analyzer, Stage::Reporter]
        );

        harness.finish(run.id, Stage::Reporter, false).await;
        harness.finish(run.id, Stage::Notifier, false).await;

        let run = harness.run(run.id).await;
        assert_eq!(run.status, OrtRunStatus::Failed);
        assert_eq!(
            harness.stages(run.id).await,
            vec![Stage::Analyzer, Stage::Reporter, Stage::Notifier]
        );
    }

    #[tokio::test]
    async fn analyzer_failure_without_reporting_fails_the_run() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&[Stage::Analyzer, Stage::Scanner]).await;

        harness.fail(run.id, Stage::Analyzer).await;

        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Failed);
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
    }

    #[tokio::test]
    async fn fatal_worker_error_fails_job_and_run() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        harness
            .send(
                run.id,
                OrchestratorMessage::WorkerError {
                    endpoint_name: Endpoint::Analyzer.name().to_string(),
                },
            )
            .await;

        let job = harness.job(run.id, Stage::Analyzer).await.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Failed);

        // Late results for a failed run only touch the job.
        harness.finish(run.id, Stage::Analyzer, false).await;
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
    }

    #[tokio::test]
    async fn worker_error_from_unknown_endpoint_is_dropped() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        harness
            .send(
                run.id,
                OrchestratorMessage::WorkerError {
                    endpoint_name: "packager".to_string(),
                },
            )
            .await;

        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Active);
    }

    #[tokio::test]
    async fn config_worker_gates_the_pipeline() {
        let config = OrchestratorConfig {
            config_worker: true,
            ..OrchestratorConfig::default()
        };
        let harness = Harness::new(config);
        let run = harness.start(&Stage::ALL).await;

        assert!(harness.stages(run.id).await.is_empty());
        let requests = harness.requests(Endpoint::Config).await;
        assert_eq!(
            requests
                .iter()
                .map(|request| request.payload.clone())
                .collect::<Vec<_>>(),
            vec![WorkerRequest::ConfigRequest { ort_run_id: run.id }]
        );

        harness
            .send(run.id, OrchestratorMessage::ConfigWorkerResult { ort_run_id: run.id })
            .await;
        harness
            .send(run.id, OrchestratorMessage::ConfigWorkerResult { ort_run_id: run.id })
            .await;
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
        assert_eq!(harness.requests(Endpoint::Analyzer).await.len(), 1);
    }

    #[tokio::test]
    async fn config_worker_error_fails_the_run() {
        let config = OrchestratorConfig {
            config_worker: true,
            ..OrchestratorConfig::default()
        };
        let harness = Harness::new(config);
        let run = harness.start(&Stage::ALL).await;

        harness
            .send(run.id, OrchestratorMessage::ConfigWorkerError { ort_run_id: run.id })
            .await;

        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Failed);
        assert!(harness.stages(run.id).await.is_empty());
    }

    #[tokio::test]
    async fn stuck_run_schedules_missing_stages() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = create_run(&harness.store, &Stage::ALL).await;
        {
            let mut tx = harness.store.begin(Some(run.id)).await.expect("begin");
            tx.update_run_status(run.id, OrtRunStatus::Active)
                .await
                .expect("activate");
            let job = tx
                .create_job(Stage::Analyzer, run.id, JobConfig::default())
                .await
                .expect("create job");
            tx.complete_job(Stage::Analyzer, job.id, JobStatus::Finished)
                .await
                .expect("complete");
            tx.commit().await.expect("commit");
        }

        harness
            .send(run.id, OrchestratorMessage::OrtRunStuckJobsError { ort_run_id: run.id })
            .await;

        assert_eq!(
            harness.stages(run.id).await,
            vec![Stage::Analyzer, Stage::Advisor, Stage::Scanner]
        );
        assert_eq!(harness.requests(Endpoint::Scanner).await.len(), 1);
    }

    #[tokio::test]
    async fn stuck_run_with_everything_done_is_finalized() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = create_run(&harness.store, &[Stage::Analyzer]).await;
        {
            let mut tx = harness.store.begin(Some(run.id)).await.expect("begin");
            tx.update_run_status(run.id, OrtRunStatus::Active)
                .await
                .expect("activate");
            let job = tx
                .create_job(Stage::Analyzer, run.id, JobConfig::default())
                .await
                .expect("create job");
            tx.complete_job(Stage::Analyzer, job.id, JobStatus::FinishedWithIssues)
                .await
                .expect("complete");
            tx.commit().await.expect("commit");
        }

        harness
            .send(run.id, OrchestratorMessage::OrtRunStuckJobsError { ort_run_id: run.id })
            .await;

        assert_eq!(
            harness.run(run.id).await.status,
            OrtRunStatus::FinishedWithIssues
        );
    }

    #[tokio::test]
    async fn stuck_check_leaves_runs_with_active_jobs_alone() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness.start(&Stage::ALL).await;

        harness
            .send(run.id, OrchestratorMessage::OrtRunStuckJobsError { ort_run_id: run.id })
            .await;

        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Active);
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
    }

    #[tokio::test]
    async fn failed_publish_leaves_the_job_created() {
        let store = InMemoryStore::new();
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|endpoint, _| {
            Err(OrchestratorError::Transport(format!("{endpoint} unavailable")))
        });
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            MessagePublisher::new(Arc::new(transport)),
            OrchestratorConfig::default(),
        );

        let run = create_run(&store, &Stage::ALL).await;
        orchestrator
            .dispatch(Message::new(
                MessageHeader::new(run.id),
                OrchestratorMessage::CreateOrtRun { run: run.clone() },
            ))
            .await
            .expect("dispatch");

        let mut tx = store.begin(None).await.expect("begin");
        let job = tx
            .get_job_for_run(Stage::Analyzer, run.id)
            .await
            .expect("get job")
            .expect("job exists");
        assert_eq!(job.status, JobStatus::Created);
    }

    /// Rejects the first `failures` sends, then forwards to memory.
    #[derive(Debug)]
    struct FlakyTransport {
        inner: Arc<InMemoryTransport>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, endpoint: Endpoint, envelope: Envelope) -> Result<()> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(OrchestratorError::Transport(format!("{endpoint} unavailable")));
            }
            self.inner.send(endpoint, envelope).await
        }

        async fn subscribe(
            &self,
            endpoint: Endpoint,
            handler: Arc<dyn MessageHandler>,
        ) -> Result<JoinHandle<()>> {
            self.inner.subscribe(endpoint, handler).await
        }
    }

    #[tokio::test]
    async fn stuck_run_sweep_republishes_unpublished_jobs() {
        let store = InMemoryStore::new();
        let inner = Arc::new(InMemoryTransport::new());
        let transport: Arc<dyn Transport> = Arc::new(FlakyTransport {
            inner: Arc::clone(&inner),
            failures: AtomicUsize::new(1),
        });
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            MessagePublisher::new(Arc::clone(&transport)),
            OrchestratorConfig::default(),
        );

        let run = create_run(&store, &[Stage::Analyzer, Stage::Scanner]).await;
        orchestrator
            .dispatch(Message::new(
                MessageHeader::new(run.id),
                OrchestratorMessage::CreateOrtRun { run: run.clone() },
            ))
            .await
            .expect("dispatch");
        let job = {
            let mut tx = store.begin(None).await.expect("begin");
            tx.get_job_for_run(Stage::Analyzer, run.id)
                .await
                .expect("get job")
                .expect("job exists")
        };
        assert_eq!(job.status, JobStatus::Created);
        assert!(inner.try_receive(Endpoint::Analyzer).await.is_none());

        let stale = chrono::Utc::now() - chrono::Duration::hours(1);
        store.backdate_job(job.id, stale).await.expect("backdate job");
        store.backdate_run(run.id, stale).await.expect("backdate run");

        let sweep = StuckRunSweep::new(
            Arc::new(store.clone()),
            MessagePublisher::new(Arc::clone(&transport)),
            StuckRunsConfig::default(),
        );
        assert_eq!(sweep.run(chrono::Utc::now()).await.expect("sweep"), 1);
        for envelope in inner.drain(Endpoint::Orchestrator).await {
            orchestrator.handle(envelope).await.expect("handle");
        }

        let requests: Vec<Message<WorkerRequest>> = inner
            .drain(Endpoint::Analyzer)
            .await
            .iter()
            .map(|envelope| envelope.decode().expect("worker request"))
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].payload.job_id(), Some(job.id));
        assert_eq!(requests[0].header.ort_run_id, run.id);

        let mut tx = store.begin(None).await.expect("begin");
        let job = tx
            .get_job(Stage::Analyzer, job.id)
            .await
            .expect("get job")
            .expect("job exists");
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(tx.jobs_for_run(run.id).await.expect("jobs").len(), 1);
    }

    #[tokio::test]
    async fn stuck_check_skips_recently_created_jobs() {
        let store = InMemoryStore::new();
        let inner = Arc::new(InMemoryTransport::new());
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            MessagePublisher::new(Arc::new(FlakyTransport {
                inner: Arc::clone(&inner),
                failures: AtomicUsize::new(1),
            })),
            OrchestratorConfig::default(),
        );
        let run = create_run(&store, &[Stage::Analyzer]).await;
        for payload in [
            OrchestratorMessage::CreateOrtRun { run: run.clone() },
            OrchestratorMessage::OrtRunStuckJobsError { ort_run_id: run.id },
        ] {
            orchestrator
                .dispatch(Message::new(MessageHeader::new(run.id), payload))
                .await
                .expect("dispatch");
        }

        assert!(inner.try_receive(Endpoint::Analyzer).await.is_none());
    }

    #[tokio::test]
    async fn analyzer_failure_blocks_evaluator_and_fails_the_run() {
        let harness = Harness::new(OrchestratorConfig::default());
        let run = harness
            .start(&[Stage::Analyzer, Stage::Advisor, Stage::Scanner, Stage::Evaluator])
            .await;

        harness.fail(run.id, Stage::Analyzer).await;

        let failed = harness.run(run.id).await;
        assert_eq!(failed.status, OrtRunStatus::Failed);
        assert!(failed.finished_at.is_some());
        assert_eq!(harness.stages(run.id).await, vec![Stage::Analyzer]);
        assert!(harness.job(run.id, Stage::Evaluator).await.is_none());
        assert!(harness.requests(Endpoint::Evaluator).await.is_empty());
        assert!(harness.requests(Endpoint::Advisor).await.is_empty());

        // A late result for the failed job must not revive the pipeline.
        harness.finish(run.id, Stage::Analyzer, false).await;
        assert_eq!(harness.run(run.id).await.status, OrtRunStatus::Failed);
        assert!(harness.job(run.id, Stage::Evaluator).await.is_none());
    }

    #[tokio::test]
    async fn undecodable_envelopes_are_dropped() {
        let harness = Harness::new(OrchestratorConfig::default());
        let envelope = Envelope {
            header: MessageHeader::new(RunId(1)),
            payload: serde_json::json!({ "type": "Nonsense" }),
        };

        harness
            .orchestrator
            .handle(envelope)
            .await
            .expect("handled");
    }
}
