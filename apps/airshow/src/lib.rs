pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod document;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use config::Config;
pub use orchestrator::{Orchestrator, RunError};
