use std::fmt::{self, Display};

/// Errors produced when parsing model values from their wire or storage form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Not a run status name.
    UnknownRunStatus(String),
    /// Not a job status name.
    UnknownJobStatus(String),
    /// Not a stage name.
    UnknownStage(String),
    /// Not an endpoint name.
    UnknownEndpoint(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownRunStatus(raw) => {
                write!(f, "unknown run status: {raw}")
            }
            ModelError::UnknownJobStatus(raw) => {
                write!(f, "unknown job status: {raw}")
            }
            ModelError::UnknownStage(raw) => write!(f, "unknown stage: {raw}"),
            ModelError::UnknownEndpoint(raw) => {
                write!(f, "unknown endpoint: {raw}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Result of parsing a model value.
pub type Result<T> = std::result::Result<T, ModelError>;
