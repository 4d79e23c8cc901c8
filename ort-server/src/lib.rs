//! Library half of the orchestrator binary: configuration loading and the
//! wiring of stores and transport into a running orchestrator.

pub mod infra;
