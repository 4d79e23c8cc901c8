//! Core data model for ORT runs shared across the orchestrator crates.

pub use ::chrono;

/// Parse errors of model values.
pub mod error;
/// Run and job identifiers.
pub mod ids;
/// Worker jobs and partial job updates.
pub mod job;
/// Runs and their per-stage configuration.
pub mod run;
/// Pipeline stages and message endpoints.
pub mod stage;
/// Run and job lifecycle statuses.
pub mod status;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{JobId, RunId};
pub use job::{JobUpdate, WorkerJob};
pub use run::{JobConfig, JobConfigurations, NewOrtRun, OrtRun};
pub use stage::{Endpoint, Stage};
pub use status::{JobStatus, OrtRunStatus};
