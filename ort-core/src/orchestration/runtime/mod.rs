//! Process-level wiring: the in-memory transport and the runtime that
//! supervises the orchestrator subscription and the maintenance loops.

mod memory_transport;
mod supervisor;

pub use memory_transport::*;
pub use supervisor::*;
