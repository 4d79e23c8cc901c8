use thiserror::Error;

use ort_model::ModelError;

/// Errors raised by the orchestrator, its stores and transports.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// PostgreSQL query failed.
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the embedded migrations failed.
    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A message or stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value does not map to a model type.
    #[error("Invalid model value: {0}")]
    Model(#[from] ModelError),

    /// The referenced run or job does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested change conflicts with the stored state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A message that cannot be handled.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Sending or receiving a message failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid or inconsistent settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Shutdown was requested while the operation ran.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Missing wiring or a broken invariant.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Domain errors are handled inside the orchestrator and never retried by
    /// the transport.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NotFound(_)
                | OrchestratorError::InvalidState(_)
                | OrchestratorError::InvalidMessage(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
