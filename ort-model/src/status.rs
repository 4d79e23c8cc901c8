use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Lifecycle status of an ORT run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum OrtRunStatus {
    /// Created but not started by the orchestrator.
    Created,
    /// Stages are being scheduled.
    Active,
    /// All jobs finished without issues.
    Finished,
    /// All jobs finished, at least one reported issues.
    FinishedWithIssues,
    /// A job or the configuration failed.
    Failed,
}

impl OrtRunStatus {
    /// Every run status in lifecycle order.
    pub const ALL: [OrtRunStatus; 5] = [
        OrtRunStatus::Created,
        OrtRunStatus::Active,
        OrtRunStatus::Finished,
        OrtRunStatus::FinishedWithIssues,
        OrtRunStatus::Failed,
    ];

    /// Terminal statuses are set once and never change afterwards.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrtRunStatus::Finished
                | OrtRunStatus::FinishedWithIssues
                | OrtRunStatus::Failed
        )
    }

    /// Storage and wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OrtRunStatus::Created => "CREATED",
            OrtRunStatus::Active => "ACTIVE",
            OrtRunStatus::Finished => "FINISHED",
            OrtRunStatus::FinishedWithIssues => "FINISHED_WITH_ISSUES",
            OrtRunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrtRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrtRunStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrtRunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownRunStatus(s.to_string()))
    }
}

/// Lifecycle status of a single worker job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum JobStatus {
    /// Persisted, trigger not yet published.
    Created,
    /// Trigger published to the worker.
    Scheduled,
    /// Picked up by the worker.
    Running,
    /// Completed without issues.
    Finished,
    /// Completed and reported issues.
    FinishedWithIssues,
    /// The worker failed or timed out.
    Failed,
}

impl JobStatus {
    /// Every job status in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Created,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::FinishedWithIssues,
        JobStatus::Failed,
    ];

    /// Statuses a job can still leave.
    pub const ACTIVE: [JobStatus; 3] =
        [JobStatus::Created, JobStatus::Scheduled, JobStatus::Running];

    /// FINISHED, FINISHED_WITH_ISSUES and FAILED are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished
                | JobStatus::FinishedWithIssues
                | JobStatus::Failed
        )
    }

    /// Storage and wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::FinishedWithIssues => "FINISHED_WITH_ISSUES",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Terminal status reported by a worker that completed its work.
    pub fn from_result(has_issues: bool) -> Self {
        if has_issues {
            JobStatus::FinishedWithIssues
        } else {
            JobStatus::Finished
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownJobStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_match_between_runs_and_jobs() {
        let terminal_runs: Vec<&str> = OrtRunStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .map(OrtRunStatus::as_str)
            .collect();
        let terminal_jobs: Vec<&str> = JobStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .map(JobStatus::as_str)
            .collect();

        assert_eq!(terminal_runs, terminal_jobs);
        assert!(JobStatus::ACTIVE.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn parses_storage_names() {
        assert_eq!(
            "FINISHED_WITH_ISSUES".parse::<JobStatus>(),
            Ok(JobStatus::FinishedWithIssues)
        );
        assert_eq!("ACTIVE".parse::<OrtRunStatus>(), Ok(OrtRunStatus::Active));
        assert_eq!(
            "active".parse::<OrtRunStatus>(),
            Err(ModelError::UnknownRunStatus("active".into()))
        );
    }
}
