//! Message contracts exchanged between the orchestrator and the workers.
//!
//! Every message travels as an [`Envelope`]: a [`MessageHeader`] plus a JSON
//! payload. Typed payloads are [`OrchestratorMessage`] for the orchestrator
//! endpoint and [`WorkerRequest`] for the worker endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use ort_model::{JobId, JobStatus, OrtRun, RunId, Stage};

use crate::error::Result;

/// Run labels with this prefix are forwarded to the transport.
pub const TRANSPORT_LABEL_PREFIX: &str = "transport.";

/// Metadata attached to every message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique per delivery attempt chain; used for tracing and dedup.
    pub token: String,
    /// Correlates the full message chain of one run.
    pub trace_id: String,
    /// Run the message belongs to.
    pub ort_run_id: RunId,
    /// Transport specific settings taken from `transport.*` run labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transport_properties: BTreeMap<String, String>,
}

impl MessageHeader {
    /// Header starting a new trace for the given run.
    pub fn new(ort_run_id: RunId) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            trace_id: Uuid::now_v7().to_string(),
            ort_run_id,
            transport_properties: BTreeMap::new(),
        }
    }

    /// Header for a follow-up message in the same trace, with a fresh token.
    pub fn follow_up(&self) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            trace_id: self.trace_id.clone(),
            ort_run_id: self.ort_run_id,
            transport_properties: self.transport_properties.clone(),
        }
    }

    /// Follow-up header carrying the transport properties of `run`.
    pub fn for_run(&self, run: &OrtRun) -> Self {
        let mut header = self.follow_up();
        header.ort_run_id = run.id;
        header.transport_properties = transport_properties(&run.labels);
        header
    }
}

/// Extracts the `transport.*` labels of a run with the prefix stripped.
pub fn transport_properties(
    labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(TRANSPORT_LABEL_PREFIX)
                .filter(|stripped| !stripped.is_empty())
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

/// Typed message with its header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    /// Routing and tracing metadata.
    pub header: MessageHeader,
    /// Message body.
    pub payload: T,
}

/// Message as carried by a transport: the payload is still serialized.
pub type Envelope = Message<serde_json::Value>;

impl<T: Serialize> Message<T> {
    /// Wraps `payload` with `header`.
    pub fn new(header: MessageHeader, payload: T) -> Self {
        Self { header, payload }
    }

    /// Serializes the payload into an [`Envelope`].
    pub fn encode(&self) -> Result<Envelope> {
        Ok(Message {
            header: self.header.clone(),
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}

impl Envelope {
    /// Deserializes the payload. Fails for messages of another type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Message<T>> {
        Ok(Message {
            header: self.header.clone(),
            payload: serde_json::from_value(self.payload.clone())?,
        })
    }
}

/// Messages consumed by the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum OrchestratorMessage {
    /// A run was created and waits to be started.
    CreateOrtRun {
        /// The created run.
        run: OrtRun,
    },

    /// The config worker finished.
    ConfigWorkerResult {
        /// Run whose configuration is ready.
        ort_run_id: RunId,
    },
    /// The config worker failed; the run cannot start.
    ConfigWorkerError {
        /// Run that failed to configure.
        ort_run_id: RunId,
    },

    /// The analyzer worker finished its job.
    AnalyzerWorkerResult {
        /// Reported job.
        job_id: JobId,
        /// Set the job to FINISHED_WITH_ISSUES instead of FINISHED.
        has_issues: bool,
    },
    /// The analyzer worker failed its job.
    AnalyzerWorkerError {
        /// Reported job.
        job_id: JobId,
    },

    /// The advisor worker finished its job.
    AdvisorWorkerResult {
        /// Reported job.
        job_id: JobId,
        /// Set the job to FINISHED_WITH_ISSUES instead of FINISHED.
        has_issues: bool,
    },
    /// The advisor worker failed its job.
    AdvisorWorkerError {
        /// Reported job.
        job_id: JobId,
    },

    /// The scanner worker finished its job.
    ScannerWorkerResult {
        /// Reported job.
        job_id: JobId,
        /// Set the job to FINISHED_WITH_ISSUES instead of FINISHED.
        has_issues: bool,
    },
    /// The scanner worker failed its job.
    ScannerWorkerError {
        /// Reported job.
        job_id: JobId,
    },

    /// The evaluator worker finished its job.
    EvaluatorWorkerResult {
        /// Reported job.
        job_id: JobId,
        /// Set the job to FINISHED_WITH_ISSUES instead of FINISHED.
        has_issues: bool,
    },
    /// The evaluator worker failed its job.
    EvaluatorWorkerError {
        /// Reported job.
        job_id: JobId,
    },

    /// The reporter worker finished its job.
    ReporterWorkerResult {
        /// Reported job.
        job_id: JobId,
        /// Set the job to FINISHED_WITH_ISSUES instead of FINISHED.
        has_issues: bool,
    },
    /// The reporter worker failed its job.
    ReporterWorkerError {
        /// Reported job.
        job_id: JobId,
    },

    /// The notifier worker finished its job.
    NotifierWorkerResult {
        /// Reported job.
        job_id: JobId,
        /// Set the job to FINISHED_WITH_ISSUES instead of FINISHED.
        has_issues: bool,
    },
    /// The notifier worker failed its job.
    NotifierWorkerError {
        /// Reported job.
        job_id: JobId,
    },

    /// Fatal error of a worker that could not be attributed to a job.
    WorkerError {
        /// Name of the endpoint the failing worker listens on.
        endpoint_name: String,
    },

    /// Self-addressed request to re-evaluate a run suspected to be stuck.
    OrtRunStuckJobsError {
        /// Run to re-evaluate.
        ort_run_id: RunId,
    },
}

/// Terminal report of a stage worker extracted from a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageOutcome {
    /// Stage of the reporting worker.
    pub stage: Stage,
    /// Job the report is about.
    pub job_id: JobId,
    /// Terminal status the job is set to.
    pub status: JobStatus,
}

impl OrchestratorMessage {
    /// Success report of the given stage worker.
    pub fn worker_result(stage: Stage, job_id: JobId, has_issues: bool) -> Self {
        match stage {
            Stage::Analyzer => Self::AnalyzerWorkerResult { job_id, has_issues },
            Stage::Advisor => Self::AdvisorWorkerResult { job_id, has_issues },
            Stage::Scanner => Self::ScannerWorkerResult { job_id, has_issues },
            Stage::Evaluator => {
                Self::EvaluatorWorkerResult { job_id, has_issues }
            }
            Stage::Reporter => Self::ReporterWorkerResult { job_id, has_issues },
            Stage::Notifier => Self::NotifierWorkerResult { job_id, has_issues },
        }
    }

    /// Failure report of the given stage worker.
    pub fn worker_error(stage: Stage, job_id: JobId) -> Self {
        match stage {
            Stage::Analyzer => Self::AnalyzerWorkerError { job_id },
            Stage::Advisor => Self::AdvisorWorkerError { job_id },
            Stage::Scanner => Self::ScannerWorkerError { job_id },
            Stage::Evaluator => Self::EvaluatorWorkerError { job_id },
            Stage::Reporter => Self::ReporterWorkerError { job_id },
            Stage::Notifier => Self::NotifierWorkerError { job_id },
        }
    }

    /// The stage outcome carried by a `<Stage>WorkerResult` or
    /// `<Stage>WorkerError`, if this is one.
    pub fn stage_outcome(&self) -> Option<StageOutcome> {
        use OrchestratorMessage::*;

        let (stage, job_id, status) = match *self {
            AnalyzerWorkerResult { job_id, has_issues } => {
                (Stage::Analyzer, job_id, JobStatus::from_result(has_issues))
            }
            AdvisorWorkerResult { job_id, has_issues } => {
                (Stage::Advisor, job_id, JobStatus::from_result(has_issues))
            }
            ScannerWorkerResult { job_id, has_issues } => {
                (Stage::Scanner, job_id, JobStatus::from_result(has_issues))
            }
            EvaluatorWorkerResult { job_id, has_issues } => {
                (Stage::Evaluator, job_id, JobStatus::from_result(has_issues))
            }
            ReporterWorkerResult { job_id, has_issues } => {
                (Stage::Reporter, job_id, JobStatus::from_result(has_issues))
            }
            NotifierWorkerResult { job_id, has_issues } => {
                (Stage::Notifier, job_id, JobStatus::from_result(has_issues))
            }
            AnalyzerWorkerError { job_id } => {
                (Stage::Analyzer, job_id, JobStatus::Failed)
            }
            AdvisorWorkerError { job_id } => {
                (Stage::Advisor, job_id, JobStatus::Failed)
            }
            ScannerWorkerError { job_id } => {
                (Stage::Scanner, job_id, JobStatus::Failed)
            }
            EvaluatorWorkerError { job_id } => {
                (Stage::Evaluator, job_id, JobStatus::Failed)
            }
            ReporterWorkerError { job_id } => {
                (Stage::Reporter, job_id, JobStatus::Failed)
            }
            NotifierWorkerError { job_id } => {
                (Stage::Notifier, job_id, JobStatus::Failed)
            }
            CreateOrtRun { .. }
            | ConfigWorkerResult { .. }
            | ConfigWorkerError { .. }
            | WorkerError { .. }
            | OrtRunStuckJobsError { .. } => return None,
        };

        Some(StageOutcome {
            stage,
            job_id,
            status,
        })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        use OrchestratorMessage::*;

        match self {
            CreateOrtRun { .. } => "CreateOrtRun",
            ConfigWorkerResult { .. } => "ConfigWorkerResult",
            ConfigWorkerError { .. } => "ConfigWorkerError",
            AnalyzerWorkerResult { .. } => "AnalyzerWorkerResult",
            AnalyzerWorkerError { .. } => "AnalyzerWorkerError",
            AdvisorWorkerResult { .. } => "AdvisorWorkerResult",
            AdvisorWorkerError { .. } => "AdvisorWorkerError",
            ScannerWorkerResult { .. } => "ScannerWorkerResult",
            ScannerWorkerError { .. } => "ScannerWorkerError",
            EvaluatorWorkerResult { .. } => "EvaluatorWorkerResult",
            EvaluatorWorkerError { .. } => "EvaluatorWorkerError",
            ReporterWorkerResult { .. } => "ReporterWorkerResult",
            ReporterWorkerError { .. } => "ReporterWorkerError",
            NotifierWorkerResult { .. } => "NotifierWorkerResult",
            NotifierWorkerError { .. } => "NotifierWorkerError",
            WorkerError { .. } => "WorkerError",
            OrtRunStuckJobsError { .. } => "OrtRunStuckJobsError",
        }
    }
}

/// Trigger messages published to the worker endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum WorkerRequest {
    /// Prepares the configuration of a run.
    ConfigRequest {
        /// Run to configure.
        ort_run_id: RunId,
    },
    /// Starts an analyzer job.
    AnalyzerRequest {
        /// Job to execute.
        job_id: JobId,
    },
    /// Starts an advisor job.
    AdvisorRequest {
        /// Job to execute.
        job_id: JobId,
    },
    /// Starts a scanner job.
    ScannerRequest {
        /// Job to execute.
        job_id: JobId,
    },
    /// Starts an evaluator job.
    EvaluatorRequest {
        /// Job to execute.
        job_id: JobId,
    },
    /// Starts a reporter job.
    ReporterRequest {
        /// Job to execute.
        job_id: JobId,
    },
    /// Starts a notifier job.
    NotifierRequest {
        /// Job to execute.
        job_id: JobId,
    },
}

impl WorkerRequest {
    /// Trigger message for a job of `stage`.
    pub fn for_stage(stage: Stage, job_id: JobId) -> Self {
        match stage {
            Stage::Analyzer => Self::AnalyzerRequest { job_id },
            Stage::Advisor => Self::AdvisorRequest { job_id },
            Stage::Scanner => Self::ScannerRequest { job_id },
            Stage::Evaluator => Self::EvaluatorRequest { job_id },
            Stage::Reporter => Self::ReporterRequest { job_id },
            Stage::Notifier => Self::NotifierRequest { job_id },
        }
    }

    /// Job the request starts. The config request has none.
    pub fn job_id(&self) -> Option<JobId> {
        match *self {
            Self::ConfigRequest { .. } => None,
            Self::AnalyzerRequest { job_id }
            | Self::AdvisorRequest { job_id }
            | Self::ScannerRequest { job_id }
            | Self::EvaluatorRequest { job_id }
            | Self::ReporterRequest { job_id }
            | Self::NotifierRequest { job_id } => Some(job_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_labels_are_stripped_of_their_prefix() {
        let labels = BTreeMap::from([
            ("transport.kubernetes.kubeprop".to_string(), "v1".to_string()),
            ("transport.".to_string(), "ignored".to_string()),
            ("team".to_string(), "compliance".to_string()),
        ]);

        let props = transport_properties(&labels);

        assert_eq!(
            props,
            BTreeMap::from([(
                "kubernetes.kubeprop".to_string(),
                "v1".to_string()
            )])
        );
    }

    #[test]
    fn follow_up_keeps_trace_but_not_token() {
        let header = MessageHeader::new(RunId(3));
        let next = header.follow_up();

        assert_eq!(next.trace_id, header.trace_id);
        assert_eq!(next.ort_run_id, RunId(3));
        assert_ne!(next.token, header.token);
    }

    #[test]
    fn stage_outcome_maps_results_and_errors() {
        for stage in Stage::ALL {
            let ok = OrchestratorMessage::worker_result(stage, JobId(5), true)
                .stage_outcome()
                .expect("result carries an outcome");
            assert_eq!(ok.stage, stage);
            assert_eq!(ok.status, JobStatus::FinishedWithIssues);

            let err = OrchestratorMessage::worker_error(stage, JobId(5))
                .stage_outcome()
                .expect("error carries an outcome");
            assert_eq!(err.status, JobStatus::Failed);
        }

        let fatal = OrchestratorMessage::WorkerError {
            endpoint_name: "scanner".into(),
        };
        assert!(fatal.stage_outcome().is_none());
    }

    #[test]
    fn envelope_decodes_to_the_typed_message() {
        let message = Message::new(
            MessageHeader::new(RunId(9)),
            OrchestratorMessage::ScannerWorkerResult {
                job_id: JobId(4),
                has_issues: false,
            },
        );

        let envelope = message.encode().expect("encode");
        assert_eq!(envelope.payload["type"], "ScannerWorkerResult");

        let decoded = envelope
            .decode::<OrchestratorMessage>()
            .expect("decode orchestrator message");
        assert_eq!(decoded, message);
    }
}
