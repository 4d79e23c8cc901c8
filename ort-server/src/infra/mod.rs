pub mod config;
pub mod orchestration;
