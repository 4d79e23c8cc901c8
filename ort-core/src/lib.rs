//! # ORT Core
//!
//! Orchestration core for ORT runs: decides which pipeline stages run, in
//! which order, and drives each run from creation to a terminal status.
//!
//! ## Overview
//!
//! - **Stage graph**: a static table of stage dependencies that derives the
//!   eligible stages from the stored state of a run
//! - **Orchestrator**: the message-driven state machine; the only component
//!   that mutates runs and jobs
//! - **Store**: transactional run/job persistence with per-run locking, backed
//!   by PostgreSQL or held in memory
//! - **Transport**: named, at-least-once message endpoints
//! - **Maintenance**: periodic sweeps that recover stuck runs and timed out
//!   jobs by messaging the orchestrator
//!
//! ## Feature Flags
//!
//! - `database`: Enables the PostgreSQL store and the embedded migrations
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ort_core::orchestration::{
//!     InMemoryStore, InMemoryTransport, OrchestratorConfig, OrchestratorRuntimeBuilder,
//! };
//!
//! async fn run() -> ort_core::error::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let runtime = OrchestratorRuntimeBuilder::new(OrchestratorConfig::default())
//!         .with_store(store.clone())
//!         .with_claims(store)
//!         .with_transport(Arc::new(InMemoryTransport::new()))
//!         .build()?;
//!
//!     runtime.start().await?;
//!     runtime.shutdown().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Embedded migrations of the PostgreSQL store.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Error types and error handling utilities
pub mod error;

/// Run orchestration: scheduling, persistence, transport and maintenance
pub mod orchestration;

pub use error::{OrchestratorError, Result};
pub use ort_model as model;
