pub mod catalog;
pub mod config;
pub mod error;
pub mod family;
pub mod hosts;
pub mod install;
pub mod ipc;
pub mod orchestrator;
pub mod process_monitor;
pub mod registry;
pub mod supervisor;
pub mod utils;

pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
