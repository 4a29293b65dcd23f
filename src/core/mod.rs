pub mod config;
pub mod errors;
pub mod message;
pub mod orchestrator;
