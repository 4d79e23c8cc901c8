//! Run orchestration: the stage graph, the message contracts, the store and
//! transport seams, the orchestrator state machine and its maintenance sweeps.

/// Orchestrator settings and their defaults.
pub mod config;
pub mod graph;
pub mod maintenance;
pub mod messages;
pub mod orchestrator;
pub mod runtime;
pub mod store;
/// Transport contract and typed publishing.
pub mod transport;

pub use config::*;
pub use graph::*;
pub use maintenance::{
    JobTimeoutSweep, MaintenanceJob, MaintenanceRegistry, MaintenanceService,
    StuckRunSweep,
};
pub use messages::*;
pub use orchestrator::*;
pub use runtime::*;
pub use store::*;
pub use transport::*;
