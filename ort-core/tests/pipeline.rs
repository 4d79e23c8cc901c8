use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use ort_core::orchestration::{
    InMemoryStore, InMemoryTransport, JobStore, MaintenanceJob, Message,
    MessageHeader, OrchestratorConfig, OrchestratorMessage, OrchestratorRuntime,
    OrchestratorRuntimeBuilder, OrchestrationStore, RunStore, StuckRunSweep,
    StuckRunsConfig, Transport, WorkerRequest,
};
use ort_model::{
    Endpoint, JobConfigurations, JobId, JobStatus, NewOrtRun, OrtRun, OrtRunStatus,
    RunId, Stage, WorkerJob,
};

const WAIT: Duration = Duration::from_secs(2);

/// Orchestrator runtime plus a hand-driven set of stage workers.
struct Pipeline {
    store: InMemoryStore,
    transport: Arc<InMemoryTransport>,
    runtime: OrchestratorRuntime,
}

impl Pipeline {
    async fn start() -> Self {
        let mut config = OrchestratorConfig::default();
        config.monitor.stuck_runs.enabled = false;
        config.monitor.job_timeouts.enabled = false;

        let store = InMemoryStore::new();
        let transport = Arc::new(InMemoryTransport::new());
        let runtime = OrchestratorRuntimeBuilder::new(config)
            .with_store(Arc::new(store.clone()))
            .with_claims(Arc::new(store.clone()))
            .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .build()
            .expect("runtime");
        runtime.start().await.expect("start runtime");

        Self {
            store,
            transport,
            runtime,
        }
    }

    async fn create(&self, stages: &[Stage]) -> OrtRun {
        let mut tx = self.store.begin(None).await.expect("begin");
        let run = tx
            .create_run(NewOrtRun::new(JobConfigurations::with_stages(stages)))
            .await
            .expect("create run");
        tx.commit().await.expect("commit");

        self.send(run.id, OrchestratorMessage::CreateOrtRun { run: run.clone() })
            .await;
        run
    }

    async fn send(&self, run_id: RunId, payload: OrchestratorMessage) {
        self.runtime
            .publisher()
            .publish(
                Endpoint::Orchestrator,
                &Message::new(MessageHeader::new(run_id), payload),
            )
            .await
            .expect("publish");
    }

    /// Waits for the next request of a stage worker.
    async fn request(&self, stage: Stage) -> WorkerRequest {
        let endpoint = stage.endpoint();
        let envelope = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(envelope) = self.transport.try_receive(endpoint).await {
                    return envelope;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no request for {stage}"));

        let message: Message<WorkerRequest> =
            envelope.decode().expect("worker request");
        message.payload
    }

    /// Receives the stage's request and answers it.
    async fn work(&self, run_id: RunId, stage: Stage, has_issues: bool) {
        let job_id = self.request(stage).await.job_id().expect("job id");
        self.send(
            run_id,
            OrchestratorMessage::worker_result(stage, job_id, has_issues),
        )
        .await;
    }

    async fn crash(&self, run_id: RunId, stage: Stage) {
        let job_id = self.request(stage).await.job_id().expect("job id");
        self.send(run_id, OrchestratorMessage::worker_error(stage, job_id))
            .await;
    }

    async fn run(&self, id: RunId) -> OrtRun {
        let mut tx = self.store.begin(None).await.expect("begin");
        tx.get_run(id).await.expect("get run").expect("run exists")
    }

    async fn jobs(&self, id: RunId) -> Vec<WorkerJob> {
        let mut tx = self.store.begin(None).await.expect("begin");
        tx.jobs_for_run(id).await.expect("jobs")
    }

    async fn owner(&self, stage: Stage, job_id: JobId) -> RunId {
        let mut tx = self.store.begin(None).await.expect("begin");
        tx.get_job(stage, job_id)
            .await
            .expect("get job")
            .expect("job exists")
            .ort_run_id
    }

    async fn wait_for_status(&self, id: RunId, status: OrtRunStatus) -> OrtRun {
        tokio::time::timeout(WAIT, async {
            loop {
                let run = self.run(id).await;
                if run.status == status {
                    return run;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("run {id} never reached {status}"))
    }

    /// Lets in-flight messages settle before asserting on absence.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn no_request(&self, stage: Stage) -> bool {
        self.settle().await;
        self.transport.try_receive(stage.endpoint()).await.is_none()
    }

    async fn stop(self) {
        self.runtime.shutdown().await.expect("shutdown");
    }
}

#[tokio::test]
async fn all_stages_run_in_pipeline_order() {
    let pipeline = Pipeline::start().await;
    let run = pipeline.create(&Stage::ALL).await;

    pipeline.work(run.id, Stage::Analyzer, false).await;
    // Advisor and scanner are requested together; answer them out of order.
    let advisor = pipeline.request(Stage::Advisor).await;
    pipeline.work(run.id, Stage::Scanner, false).await;
    assert!(pipeline.no_request(Stage::Evaluator).await);

    pipeline
        .send(
            run.id,
            OrchestratorMessage::worker_result(
                Stage::Advisor,
                advisor.job_id().expect("job id"),
                false,
            ),
        )
        .await;
    pipeline.work(run.id, Stage::Evaluator, false).await;
    pipeline.work(run.id, Stage::Reporter, false).await;
    pipeline.work(run.id, Stage::Notifier, false).await;

    let finished = pipeline.wait_for_status(run.id, OrtRunStatus::Finished).await;
    assert!(finished.finished_at.is_some());
    let jobs = pipeline.jobs(run.id).await;
    assert_eq!(jobs.len(), Stage::ALL.len());
    assert!(jobs.iter().all(|job| job.status == JobStatus::Finished));

    pipeline.stop().await;
}

#[tokio::test]
async fn issues_in_one_stage_mark_the_whole_run() {
    let pipeline = Pipeline::start().await;
    let run = pipeline.create(&[Stage::Analyzer, Stage::Scanner]).await;

    pipeline.work(run.id, Stage::Analyzer, false).await;
    pipeline.work(run.id, Stage::Scanner, true).await;

    let run = pipeline
        .wait_for_status(run.id, OrtRunStatus::FinishedWithIssues)
        .await;
    assert!(run.finished_at.is_some());

    pipeline.stop().await;
}

#[tokio::test]
async fn failed_advisor_skips_evaluator_but_reports() {
    let pipeline = Pipeline::start().await;
    let run = pipeline.create(&Stage::ALL).await;

    pipeline.work(run.id, Stage::Analyzer, false).await;
    pipeline.crash(run.id, Stage::Advisor).await;
    // Reporting waits for the scanner still in flight.
    assert!(pipeline.no_request(Stage::Reporter).await);
    assert_eq!(pipeline.run(run.id).await.status, OrtRunStatus::Active);

    pipeline.work(run.id, Stage::Scanner, false).await;
    pipeline.work(run.id, Stage::Reporter, false).await;
    pipeline.work(run.id, Stage::Notifier, false).await;

    pipeline.wait_for_status(run.id, OrtRunStatus::Failed).await;
    let stages: Vec<Stage> = pipeline
        .jobs(run.id)
        .await
        .into_iter()
        .map(|job| job.stage)
        .collect();
    assert!(!stages.contains(&Stage::Evaluator));

    pipeline.stop().await;
}

#[tokio::test]
async fn duplicate_results_schedule_successors_once() {
    let pipeline = Pipeline::start().await;
    let run = pipeline
        .create(&[Stage::Analyzer, Stage::Advisor, Stage::Scanner])
        .await;

    let job_id = pipeline
        .request(Stage::Analyzer)
        .await
        .job_id()
        .expect("job id");
    let result = OrchestratorMessage::worker_result(Stage::Analyzer, job_id, false);
    join_all((0..4).map(|_| pipeline.send(run.id, result.clone()))).await;

    pipeline.request(Stage::Advisor).await;
    pipeline.request(Stage::Scanner).await;
    assert!(pipeline.no_request(Stage::Advisor).await);
    assert!(pipeline.no_request(Stage::Scanner).await);
    assert_eq!(pipeline.jobs(run.id).await.len(), 3);

    pipeline.stop().await;
}

#[tokio::test]
async fn terminal_status_survives_late_messages() {
    let pipeline = Pipeline::start().await;
    let run = pipeline.create(&[Stage::Analyzer]).await;

    let job_id = pipeline
        .request(Stage::Analyzer)
        .await
        .job_id()
        .expect("job id");
    pipeline
        .send(
            run.id,
            OrchestratorMessage::worker_result(Stage::Analyzer, job_id, false),
        )
        .await;
    let finished = pipeline.wait_for_status(run.id, OrtRunStatus::Finished).await;

    pipeline
        .send(run.id, OrchestratorMessage::worker_error(Stage::Analyzer, job_id))
        .await;
    pipeline
        .send(
            run.id,
            OrchestratorMessage::OrtRunStuckJobsError { ort_run_id: run.id },
        )
        .await;
    pipeline.settle().await;

    let after = pipeline.run(run.id).await;
    assert_eq!(after.status, OrtRunStatus::Finished);
    assert_eq!(after.finished_at, finished.finished_at);

    pipeline.stop().await;
}

#[tokio::test]
async fn stuck_run_sweep_recovers_lost_scheduling() {
    let pipeline = Pipeline::start().await;
    let run = pipeline
        .create(&[Stage::Analyzer, Stage::Advisor, Stage::Scanner])
        .await;

    // The analyzer finishes, but its result never reaches the orchestrator.
    let job_id = pipeline
        .request(Stage::Analyzer)
        .await
        .job_id()
        .expect("job id");
    {
        let mut tx = pipeline.store.begin(Some(run.id)).await.expect("begin");
        tx.complete_job(Stage::Analyzer, job_id, JobStatus::Finished)
            .await
            .expect("complete");
        tx.commit().await.expect("commit");
    }
    pipeline
        .store
        .backdate_run(run.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .expect("backdate");

    let sweep = StuckRunSweep::new(
        pipeline.runtime.store(),
        pipeline.runtime.publisher(),
        StuckRunsConfig {
            enabled: true,
            interval_secs: 60,
            min_age_secs: 600,
        },
    );
    let notified = sweep.run(Utc::now()).await.expect("sweep");
    assert_eq!(notified, 1);

    pipeline.work(run.id, Stage::Advisor, false).await;
    pipeline.work(run.id, Stage::Scanner, false).await;
    pipeline.wait_for_status(run.id, OrtRunStatus::Finished).await;

    pipeline.stop().await;
}

#[tokio::test]
async fn results_for_other_runs_do_not_interfere() {
    let pipeline = Pipeline::start().await;
    let first = pipeline.create(&[Stage::Analyzer]).await;
    let second = pipeline.create(&[Stage::Analyzer]).await;

    let mut jobs = Vec::new();
    for _ in 0..2 {
        jobs.push(
            pipeline
                .request(Stage::Analyzer)
                .await
                .job_id()
                .expect("job id"),
        );
    }
    for job_id in jobs {
        let run_id = pipeline.owner(Stage::Analyzer, job_id).await;
        let has_issues = run_id == second.id;
        pipeline
            .send(
                run_id,
                OrchestratorMessage::worker_result(Stage::Analyzer, job_id, has_issues),
            )
            .await;
    }

    pipeline.wait_for_status(first.id, OrtRunStatus::Finished).await;
    pipeline
        .wait_for_status(second.id, OrtRunStatus::FinishedWithIssues)
        .await;

    pipeline.stop().await;
}
