use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ids::RunId;
use crate::stage::Stage;
use crate::status::OrtRunStatus;

/// Immutable configuration for one stage's job. Its content is interpreted
/// by the worker only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobConfig {
    /// Worker specific options.
    #[cfg_attr(feature = "serde", serde(default))]
    pub options: BTreeMap<String, String>,
}

impl JobConfig {
    /// Adds a worker option.
    pub fn with_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Per-stage configuration of a run. A stage without configuration is
/// disabled and never gets a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct JobConfigurations {
    /// Analyzer stage.
    pub analyzer: Option<JobConfig>,
    /// Advisor stage.
    pub advisor: Option<JobConfig>,
    /// Scanner stage.
    pub scanner: Option<JobConfig>,
    /// Evaluator stage.
    pub evaluator: Option<JobConfig>,
    /// Reporter stage.
    pub reporter: Option<JobConfig>,
    /// Notifier stage.
    pub notifier: Option<JobConfig>,
}

impl JobConfigurations {
    /// Configuration with every stage enabled and empty options.
    pub fn all_enabled() -> Self {
        Self::with_stages(&Stage::ALL)
    }

    /// Configuration enabling exactly the given stages.
    pub fn with_stages(stages: &[Stage]) -> Self {
        let mut configs = Self::default();
        for stage in stages {
            *configs.slot_mut(*stage) = Some(JobConfig::default());
        }
        configs
    }

    /// Configuration of `stage`, `None` when disabled.
    pub fn get(&self, stage: Stage) -> Option<&JobConfig> {
        match stage {
            Stage::Analyzer => self.analyzer.as_ref(),
            Stage::Advisor => self.advisor.as_ref(),
            Stage::Scanner => self.scanner.as_ref(),
            Stage::Evaluator => self.evaluator.as_ref(),
            Stage::Reporter => self.reporter.as_ref(),
            Stage::Notifier => self.notifier.as_ref(),
        }
    }

    /// The stage has a configuration.
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.get(stage).is_some()
    }

    /// Enabled stages in pipeline order.
    pub fn enabled_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }

    fn slot_mut(&mut self, stage: Stage) -> &mut Option<JobConfig> {
        match stage {
            Stage::Analyzer => &mut self.analyzer,
            Stage::Advisor => &mut self.advisor,
            Stage::Scanner => &mut self.scanner,
            Stage::Evaluator => &mut self.evaluator,
            Stage::Reporter => &mut self.reporter,
            Stage::Notifier => &mut self.notifier,
        }
    }
}

/// Values supplied when a run is created; the store assigns id and timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewOrtRun {
    /// Free-form labels. `transport.*` labels configure the transport.
    #[cfg_attr(feature = "serde", serde(default))]
    pub labels: BTreeMap<String, String>,
    /// Stages to run and their configuration.
    #[cfg_attr(feature = "serde", serde(default))]
    pub job_configs: JobConfigurations,
}

impl NewOrtRun {
    /// Run without labels.
    pub fn new(job_configs: JobConfigurations) -> Self {
        Self {
            labels: BTreeMap::new(),
            job_configs,
        }
    }

    /// Adds a label.
    pub fn with_label(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// One end-to-end execution of the pipeline over a repository revision.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OrtRun {
    /// Store assigned id.
    pub id: RunId,
    /// Current lifecycle status.
    pub status: OrtRunStatus,
    /// Labels given on creation.
    pub labels: BTreeMap<String, String>,
    /// Per-stage configuration given on creation.
    pub job_configs: JobConfigurations,
    /// Set by the store on creation.
    pub created_at: DateTime<Utc>,
    /// Touched whenever the run or one of its jobs changes.
    pub updated_at: DateTime<Utc>,
    /// Set iff `status` is terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl OrtRun {
    /// The run has reached a final status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
