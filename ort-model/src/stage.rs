use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// A job-tracked phase of the ORT pipeline.
///
/// The implicit configuration phase that precedes the analyzer is not a
/// `Stage`; it only exists as the [`Endpoint::Config`] endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Stage {
    /// Resolves the dependencies of the project.
    Analyzer,
    /// Looks up vulnerabilities of the dependencies.
    Advisor,
    /// Scans source code for licenses and copyrights.
    Scanner,
    /// Applies policy rules to the collected data.
    Evaluator,
    /// Renders the reports.
    Reporter,
    /// Sends notifications about the finished run.
    Notifier,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 6] = [
        Stage::Analyzer,
        Stage::Advisor,
        Stage::Scanner,
        Stage::Evaluator,
        Stage::Reporter,
        Stage::Notifier,
    ];

    /// Stable lowercase name used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analyzer => "analyzer",
            Stage::Advisor => "advisor",
            Stage::Scanner => "scanner",
            Stage::Evaluator => "evaluator",
            Stage::Reporter => "reporter",
            Stage::Notifier => "notifier",
        }
    }

    /// Endpoint the stage worker listens on.
    pub fn endpoint(self) -> Endpoint {
        Endpoint::from(self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ModelError::UnknownStage(s.to_string()))
    }
}

/// A named message channel. One per worker type plus one for the
/// orchestrator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Endpoint {
    /// Consumed by the orchestrator.
    Orchestrator,
    /// Config worker.
    Config,
    /// Analyzer worker.
    Analyzer,
    /// Advisor worker.
    Advisor,
    /// Scanner worker.
    Scanner,
    /// Evaluator worker.
    Evaluator,
    /// Reporter worker.
    Reporter,
    /// Notifier worker.
    Notifier,
}

impl Endpoint {
    /// Every endpoint, the orchestrator first.
    pub const ALL: [Endpoint; 8] = [
        Endpoint::Orchestrator,
        Endpoint::Config,
        Endpoint::Analyzer,
        Endpoint::Advisor,
        Endpoint::Scanner,
        Endpoint::Evaluator,
        Endpoint::Reporter,
        Endpoint::Notifier,
    ];

    /// Name used for broker queues and in `WorkerError` messages.
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Orchestrator => "orchestrator",
            Endpoint::Config => "config",
            Endpoint::Analyzer => "analyzer",
            Endpoint::Advisor => "advisor",
            Endpoint::Scanner => "scanner",
            Endpoint::Evaluator => "evaluator",
            Endpoint::Reporter => "reporter",
            Endpoint::Notifier => "notifier",
        }
    }

    /// The stage served by this endpoint, if it is a job-tracked worker.
    pub fn stage(self) -> Option<Stage> {
        match self {
            Endpoint::Orchestrator | Endpoint::Config => None,
            Endpoint::Analyzer => Some(Stage::Analyzer),
            Endpoint::Advisor => Some(Stage::Advisor),
            Endpoint::Scanner => Some(Stage::Scanner),
            Endpoint::Evaluator => Some(Stage::Evaluator),
            Endpoint::Reporter => Some(Stage::Reporter),
            Endpoint::Notifier => Some(Stage::Notifier),
        }
    }
}

impl From<Stage> for Endpoint {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Analyzer => Endpoint::Analyzer,
            Stage::Advisor => Endpoint::Advisor,
            Stage::Scanner => Endpoint::Scanner,
            Stage::Evaluator => Endpoint::Evaluator,
            Stage::Reporter => Endpoint::Reporter,
            Stage::Notifier => Endpoint::Notifier,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Endpoint {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .into_iter()
            .find(|endpoint| endpoint.name() == s)
            .ok_or_else(|| ModelError::UnknownEndpoint(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_has_its_own_endpoint() {
        for stage in Stage::ALL {
            assert_eq!(stage.endpoint().stage(), Some(stage));
            assert_eq!(stage.endpoint().name(), stage.as_str());
        }
        assert_eq!(Endpoint::Config.stage(), None);
        assert_eq!(Endpoint::Orchestrator.stage(), None);
    }

    #[test]
    fn endpoint_names_parse_back() {
        assert_eq!("config".parse::<Endpoint>(), Ok(Endpoint::Config));
        assert!("kafka".parse::<Endpoint>().is_err());
    }
}
